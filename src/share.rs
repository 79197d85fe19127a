//! Share links: `https://<host>/whiteboard/{id}?key={sessionKeyHex}`.
//!
//! The key only ever lives in the link a user chooses to share and in memory.
//! A link without a key gets fresh key material appended.

use url::Url;
use uuid::Uuid;

use crate::crypto::{CryptoError, SessionKey};

const WHITEBOARD_SEGMENT: &str = "whiteboard";
const KEY_PARAM: &str = "key";

#[derive(Debug, thiserror::Error)]
pub enum ShareLinkError {
    #[error("invalid share link: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("share link does not point at /whiteboard/{{id}}")]
    MissingWhiteboardId,
    #[error("share link carries a malformed key")]
    InvalidKey(#[from] CryptoError),
}

impl crate::frame::ErrorCode for ShareLinkError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidUrl(_) => "E_SHARE_LINK_URL",
            Self::MissingWhiteboardId => "E_SHARE_LINK_ID",
            Self::InvalidKey(_) => "E_SHARE_LINK_KEY",
        }
    }
}

/// A resolved share link: which whiteboard, and the secret to open it.
#[derive(Debug, Clone)]
pub struct ShareLink {
    origin: Url,
    pub whiteboard_id: Uuid,
    pub key: SessionKey,
    /// True when the link had no key and fresh material was generated.
    pub key_generated: bool,
}

impl ShareLink {
    /// A brand-new whiteboard on `origin` with fresh key material.
    ///
    /// # Errors
    ///
    /// Returns `InvalidUrl` if `origin` is not an absolute URL.
    pub fn new_whiteboard(origin: &str) -> Result<Self, ShareLinkError> {
        Ok(Self {
            origin: origin_of(&Url::parse(origin)?),
            whiteboard_id: Uuid::new_v4(),
            key: SessionKey::generate(),
            key_generated: true,
        })
    }

    /// Parse a link, generating key material when the `key` param is absent.
    ///
    /// # Errors
    ///
    /// Fails on unparseable URLs, paths that are not `/whiteboard/{uuid}`,
    /// and keys that are not 64 hex characters.
    pub fn parse(link: &str) -> Result<Self, ShareLinkError> {
        let url = Url::parse(link)?;

        let mut segments = url.path_segments().ok_or(ShareLinkError::MissingWhiteboardId)?;
        let whiteboard_id = match (segments.next(), segments.next()) {
            (Some(WHITEBOARD_SEGMENT), Some(id)) => {
                Uuid::parse_str(id).map_err(|_| ShareLinkError::MissingWhiteboardId)?
            }
            _ => return Err(ShareLinkError::MissingWhiteboardId),
        };

        let key_param = url
            .query_pairs()
            .find(|(name, _)| name == KEY_PARAM)
            .map(|(_, value)| value.into_owned());
        let (key, key_generated) = match key_param {
            Some(hex) => (SessionKey::from_hex(&hex)?, false),
            None => (SessionKey::generate(), true),
        };

        Ok(Self { origin: origin_of(&url), whiteboard_id, key, key_generated })
    }

    /// Render the full link including the key.
    #[must_use]
    pub fn to_url(&self) -> String {
        let mut url = self.origin.clone();
        url.set_path(&format!("/{WHITEBOARD_SEGMENT}/{}", self.whiteboard_id));
        url.query_pairs_mut().append_pair(KEY_PARAM, &self.key.to_hex());
        url.to_string()
    }

    /// Scheme + host (+ port) the link points at.
    #[must_use]
    pub fn origin(&self) -> &str {
        self.origin.as_str().trim_end_matches('/')
    }
}

fn origin_of(url: &Url) -> Url {
    let mut origin = url.clone();
    origin.set_path("/");
    origin.set_query(None);
    origin.set_fragment(None);
    origin
}

#[cfg(test)]
#[path = "share_test.rs"]
mod tests;
