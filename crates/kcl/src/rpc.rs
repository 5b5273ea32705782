//! The host-callable RPC surface.
//!
//! A request/response protocol over length-prefixed frames (varint size +
//! protobuf body). This module implements the request/response types and
//! the framing contract only, as a description of external callers'
//! interfaces; no network listener is wired up (left as a documented
//! extension point, see `DESIGN.md`).

use serde::{Deserialize, Serialize};

use crate::errors::KclError;

/// One frame on the wire: a varint length prefix followed by exactly that
/// many bytes of request or response body. Framing is a plain length-prefix,
/// not itself protobuf — only the body is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub body_len: u64,
}

impl FrameHeader {
    /// Encodes `body_len` as an LEB128 varint, the same encoding protobuf
    /// itself uses for its own varint fields.
    #[must_use]
    pub fn encode_varint(self) -> Vec<u8> {
        let mut n = self.body_len;
        let mut out = Vec::new();
        loop {
            let byte = (n & 0x7f) as u8;
            n >>= 7;
            if n == 0 {
                out.push(byte);
                return out;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a varint-prefixed frame length from `bytes`, returning the
    /// value and the number of bytes the varint itself occupied.
    #[must_use]
    pub fn decode_varint(bytes: &[u8]) -> Option<(u64, usize)> {
        let mut value: u64 = 0;
        for (i, &byte) in bytes.iter().enumerate() {
            value |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Some((value, i + 1));
            }
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecProgramArgs {
    pub program: ProgramRef,
    pub strict_range_check: bool,
}

/// A serializable stand-in for `ast::Program`: the wire format carries a
/// resolved program the same way the in-process API does, since source
/// parsing is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramRef {
    pub root: String,
    pub main: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecProgramResult {
    pub yaml_result: String,
    pub json_result: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCodeArgs {
    pub code: String,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveCodeArgs {
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSchemaTypeArgs {
    pub file: String,
    pub schema_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateCodeArgs {
    pub data: String,
    pub code: String,
    pub attribute_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpliceCodeArgs {
    pub file: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDepFilesArgs {
    pub work_dir: String,
}

/// A structured RPC error carrying an optional source location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub message: String,
    pub filename: Option<String>,
    pub line: Option<u32>,
}

impl From<KclError> for RpcError {
    fn from(err: KclError) -> Self {
        Self {
            message: err.message,
            filename: (err.primary.file != "<unknown>").then(|| err.primary.file.clone()),
            line: (err.primary.line != 0).then_some(err.primary.line),
        }
    }
}

/// Every RPC method this host exposes, dispatched over whatever transport
/// carries the framed request bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Method {
    Ping,
    ListMethod,
    ExecProgram(ExecProgramArgs),
    EvalCode(EvalCodeArgs),
    ResolveCode(ResolveCodeArgs),
    GetSchemaType(GetSchemaTypeArgs),
    ValidateCode(ValidateCodeArgs),
    SpliceCode(SpliceCodeArgs),
    ListDepFiles(ListDepFilesArgs),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Pong,
    Methods(Vec<String>),
    ExecProgram(ExecProgramResult),
    /// A planned value tree, JSON-encoded the same way `plan::to_json`
    /// renders one for the CLI's `--format json` output.
    Value(serde_json::Value),
    Error(RpcError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trips() {
        for len in [0_u64, 1, 127, 128, 300, 1 << 20] {
            let header = FrameHeader { body_len: len };
            let encoded = header.encode_varint();
            let (decoded, consumed) = FrameHeader::decode_varint(&encoded).unwrap();
            assert_eq!(decoded, len);
            assert_eq!(consumed, encoded.len());
        }
    }
}
