//! Stable item identity.
//!
//! The key is a SHA-256 hex digest, so it is always [`ITEM_KEY_LEN`] characters.
//! Keyword targets hash the keyword alone: price range, condition and exclusion
//! filters stay out of the key so that narrowing a watch keeps its history.
//! Changing anything here re-keys every stored item.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::Target;

pub const ITEM_KEY_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("target has neither a url nor a search keyword")]
    MissingAnchor,
}

pub fn resolve_item_key(
    url: Option<&str>,
    search_keyword: Option<&str>,
    store: Option<&str>,
) -> Result<String, IdentityError> {
    if let Some(keyword) = non_empty(search_keyword) {
        return Ok(digest(&["keyword", keyword]));
    }
    let url = non_empty(url).ok_or(IdentityError::MissingAnchor)?;
    match non_empty(store) {
        Some(store) => Ok(digest(&["url+store", store, url])),
        None => Ok(digest(&["url", url])),
    }
}

impl Target {
    /// Key for this target; `fold_store` disambiguates stores sharing URL shapes.
    pub fn item_key(&self, fold_store: bool) -> Result<String, IdentityError> {
        let store = fold_store.then_some(self.store.as_str());
        resolve_item_key(self.url.as_deref(), self.search_keyword.as_deref(), store)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
