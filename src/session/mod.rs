//! Session module - per-connection request tracking.
//!
//! A [`SessionTable`] belongs to one front-facing connection and maps request
//! ids to [`Request`]s. It has no I/O of its own: the bridge feeds it decoded
//! records and acts on the outcomes it reports.

mod request;
mod table;

pub use request::{InputChunk, Request, RequestState};
pub use table::{
    AbortAction, InputProgress, ParamsProgress, SessionTable, DEFAULT_MAX_BUFFERED_INPUT,
    DEFAULT_MAX_PARAMS_SIZE,
};

use serde::{Deserialize, Serialize};

use crate::protocol::{NameValuePair, VAR_MAX_CONNS, VAR_MAX_REQS, VAR_MPXS_CONNS};

/// Limits one side of the protocol declares through the management
/// variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// `FCGI_MAX_CONNS`
    pub max_conns: u32,
    /// `FCGI_MAX_REQS`
    pub max_reqs: u32,
    /// `FCGI_MPXS_CONNS`
    pub mpxs_conns: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_conns: 1,
            max_reqs: 1,
            mpxs_conns: false,
        }
    }
}

impl Capabilities {
    /// Value of one management variable, `None` for names not understood.
    pub fn value_of(&self, name: &[u8]) -> Option<String> {
        if name == VAR_MAX_CONNS.as_bytes() {
            Some(self.max_conns.to_string())
        } else if name == VAR_MAX_REQS.as_bytes() {
            Some(self.max_reqs.to_string())
        } else if name == VAR_MPXS_CONNS.as_bytes() {
            Some(if self.mpxs_conns { "1" } else { "0" }.to_string())
        } else {
            None
        }
    }

    /// Build from a get-values-result.
    ///
    /// Missing or unparsable values keep the single-request defaults.
    pub fn from_pairs(pairs: &[NameValuePair]) -> Self {
        let mut caps = Self::default();
        for pair in pairs {
            let raw = pair.value_str();
            let value = raw.trim();
            match pair.name.as_ref() {
                name if name == VAR_MAX_CONNS.as_bytes() => {
                    caps.max_conns = value.parse().unwrap_or(caps.max_conns);
                }
                name if name == VAR_MAX_REQS.as_bytes() => {
                    caps.max_reqs = value.parse().unwrap_or(caps.max_reqs);
                }
                name if name == VAR_MPXS_CONNS.as_bytes() => {
                    caps.mpxs_conns = value == "1";
                }
                _ => {}
            }
        }
        caps
    }

    /// Requests one connection may carry at once.
    pub fn concurrent_requests(&self) -> usize {
        if self.mpxs_conns {
            self.max_reqs.max(1) as usize
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_from_pairs() {
        let caps = Capabilities::from_pairs(&[
            NameValuePair::from_strs(VAR_MAX_CONNS, "4"),
            NameValuePair::from_strs(VAR_MAX_REQS, " 16 "),
            NameValuePair::from_strs(VAR_MPXS_CONNS, "1"),
            NameValuePair::from_strs("SOMETHING_ELSE", "x"),
        ]);
        assert_eq!(caps.max_conns, 4);
        assert_eq!(caps.max_reqs, 16);
        assert!(caps.mpxs_conns);
        assert_eq!(caps.concurrent_requests(), 16);
    }

    #[test]
    fn test_missing_answers_mean_single_request() {
        let caps = Capabilities::from_pairs(&[NameValuePair::from_strs(VAR_MAX_REQS, "nope")]);
        assert_eq!(caps, Capabilities::default());
        assert_eq!(caps.concurrent_requests(), 1);
    }

    #[test]
    fn test_value_of() {
        let caps = Capabilities::default();
        assert_eq!(caps.value_of(b"FCGI_MPXS_CONNS").as_deref(), Some("0"));
        assert_eq!(caps.value_of(b"FCGI_MAX_REQS").as_deref(), Some("1"));
        assert_eq!(caps.value_of(b"HTTP_HOST"), None);
    }
}
