//! Output encoding.

use std::io::{self, Write};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use secpol_common::PolicyResult;
use secpol_oci::SecurityPolicy;

/// A policy in its transport encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPolicy {
    /// Compact JSON.
    pub json: String,
    /// Standard base64 of `json`.
    pub base64: String,
}

impl EncodedPolicy {
    /// Serialize and encode `policy`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the policy cannot be rendered.
    pub fn encode(policy: &SecurityPolicy) -> PolicyResult<Self> {
        let json = serde_json::to_string(policy)?;
        let base64 = BASE64.encode(json.as_bytes());
        Ok(Self { json, base64 })
    }

    /// Write the base64 line, preceded by the JSON line if `with_json`.
    ///
    /// # Errors
    ///
    /// Returns any write error.
    pub fn write_to(&self, out: &mut impl Write, with_json: bool) -> io::Result<()> {
        if with_json {
            writeln!(out, "{}", self.json)?;
        }
        writeln!(out, "{}", self.base64)?;
        out.flush()
    }
}
