//! Session-owned storage for image payloads referenced by output items.

use std::{collections::HashMap, fmt, sync::Arc};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Image encodings the classifier extracts from MIME bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
}

impl ImageFormat {
    #[must_use]
    pub const fn mime(self) -> &'static str {
        match self {
            Self::Png => "image/png",
        }
    }

    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
        }
    }
}

/// Handle to one stored image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageKey(Uuid);

impl ImageKey {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone)]
struct StoredImage {
    format: ImageFormat,
    base64: Arc<str>,
}

/// Image payloads partitioned by the execution request that produced them.
///
/// A partition is released when its request's results are replaced; the
/// whole arena goes away with the session.
#[derive(Debug, Default)]
pub struct ImageArena {
    images: HashMap<ImageKey, StoredImage>,
    by_request: HashMap<String, Vec<ImageKey>>,
}

impl ImageArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a base64 payload under a key that has never been issued by
    /// this arena.
    pub fn insert(&mut self, request_id: &str, format: ImageFormat, base64: &str) -> ImageKey {
        let mut key = ImageKey::generate();
        while self.images.contains_key(&key) {
            key = ImageKey::generate();
        }

        self.images.insert(
            key,
            StoredImage {
                format,
                base64: Arc::from(base64),
            },
        );
        self.by_request
            .entry(request_id.to_string())
            .or_default()
            .push(key);
        key
    }

    /// The base64 payload for `key`.
    #[must_use]
    pub fn get(&self, key: &ImageKey) -> Option<Arc<str>> {
        self.images.get(key).map(|img| Arc::clone(&img.base64))
    }

    #[must_use]
    pub fn format(&self, key: &ImageKey) -> Option<ImageFormat> {
        self.images.get(key).map(|img| img.format)
    }

    /// Decoded image bytes for `key`. Returns `None` for unknown keys or
    /// payloads that are not valid base64.
    #[must_use]
    pub fn decode(&self, key: &ImageKey) -> Option<Vec<u8>> {
        let payload = self.images.get(key)?;
        let compact: String = payload
            .base64
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        BASE64.decode(compact).ok()
    }

    /// Keys issued for `request_id`, in insertion order.
    #[must_use]
    pub fn keys_for(&self, request_id: &str) -> &[ImageKey] {
        self.by_request.get(request_id).map_or(&[], Vec::as_slice)
    }

    /// Drop every image produced by `request_id`. Returns how many were freed.
    pub fn release(&mut self, request_id: &str) -> usize {
        let Some(keys) = self.by_request.remove(request_id) else {
            return 0;
        };
        for key in &keys {
            self.images.remove(key);
        }
        keys.len()
    }

    /// Release every partition except `keep`.
    pub fn retain_only(&mut self, keep: &str) {
        let stale: Vec<String> = self
            .by_request
            .keys()
            .filter(|id| id.as_str() != keep)
            .cloned()
            .collect();
        for id in stale {
            self.release(&id);
        }
    }

    pub fn clear(&mut self) {
        self.images.clear();
        self.by_request.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}
