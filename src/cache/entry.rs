//! Cache Entry Types
//!
//! The resource locator used as cache key and fetch-dedup key, and the entry
//! stored by the memory tier.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use crate::imaging::Bitmap;

/// Identifier of a remote image resource, canonically its absolute URL.
///
/// Cheap to clone; equality and hashing are by string content.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locator(Arc<str>);

impl Locator {
    /// Create a locator from a URL string
    pub fn new(url: impl AsRef<str>) -> Self {
        Self(Arc::from(url.as_ref()))
    }

    /// Parse an optional, possibly blank URL.
    ///
    /// Returns `None` for missing or whitespace-only input, which callers treat as
    /// "no resource requested".
    pub fn parse(url: Option<&str>) -> Option<Self> {
        let trimmed = url?.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self::new(trimmed))
        }
    }

    /// Get the locator as a string slice
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Locator({:?})", &*self.0)
    }
}

impl Borrow<str> for Locator {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Locator {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for Locator {
    fn from(url: String) -> Self {
        Self(Arc::from(url))
    }
}

/// Memory tier entry: a decoded bitmap plus its eviction cost
#[derive(Clone)]
pub struct CacheEntry {
    locator: Locator,
    bitmap: Bitmap,
    cost: u64,
}

impl CacheEntry {
    /// Create an entry with an explicit cost
    pub fn new(locator: Locator, bitmap: Bitmap, cost: u64) -> Self {
        Self {
            locator,
            bitmap,
            cost,
        }
    }

    /// Create an entry costed by the bitmap's row stride times height
    pub fn from_bitmap(locator: Locator, bitmap: Bitmap) -> Self {
        let cost = bitmap.byte_cost();
        Self::new(locator, bitmap, cost)
    }

    #[inline]
    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    #[inline]
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Estimated byte cost used for eviction accounting
    #[inline]
    pub fn cost(&self) -> u64 {
        self.cost
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("locator", &self.locator)
            .field("width", &self.bitmap.width())
            .field("height", &self.bitmap.height())
            .field("cost", &self.cost)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_locator_equality() {
        let a = Locator::new("https://img/cover-1.jpg");
        let b = Locator::from("https://img/cover-1.jpg".to_string());
        let c = Locator::new("https://img/cover-2.jpg");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_locator_hashing() {
        let mut set = HashSet::new();
        set.insert(Locator::new("https://img/a.jpg"));
        set.insert(Locator::new("https://img/a.jpg"));
        set.insert(Locator::new("https://img/b.jpg"));

        assert_eq!(set.len(), 2);
        assert!(set.contains("https://img/a.jpg"));
    }

    #[test]
    fn test_locator_parse_blank() {
        assert_eq!(Locator::parse(None), None);
        assert_eq!(Locator::parse(Some("")), None);
        assert_eq!(Locator::parse(Some("   ")), None);
        assert_eq!(
            Locator::parse(Some(" https://img/a.jpg ")),
            Some(Locator::new("https://img/a.jpg"))
        );
    }

    #[test]
    fn test_locator_display() {
        let locator = Locator::new("https://img/a.jpg");
        assert_eq!(locator.to_string(), "https://img/a.jpg");
        assert_eq!(locator.as_str(), "https://img/a.jpg");
    }

    #[test]
    fn test_entry_cost_from_bitmap() {
        let bitmap = Bitmap::new(image::RgbaImage::new(10, 4));
        let entry = CacheEntry::from_bitmap(Locator::new("https://img/a.jpg"), bitmap);

        // 10 px * 4 bytes per row, 4 rows
        assert_eq!(entry.cost(), 160);
        let debug = format!("{:?}", entry);
        assert!(debug.contains("CacheEntry"));
        assert!(debug.contains("cost"));
    }
}
