//! Packet-level primitives on top of `rsip`: transaction identity,
//! Call-ID access and response construction.

use crate::Result;
use rsip::{
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Method, Request, Response, SipMessage, StatusCode,
};

pub const BRANCH_MAGIC: &str = "z9hG4bK";

/// Transaction identity used to match a response to its outstanding
/// request.
///
/// The `Branch` profile is the RFC 3261 identity `(top-Via branch, CSeq
/// method)`. The `CallSeq` profile `(Call-ID, CSeq)` is stable across Via
/// insertion and is what the delivery queue keys on: an outbound request
/// only gets its Via once it traverses a leg, while the matching response
/// already carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tid {
    Branch { branch: String, method: Method },
    CallSeq { call_id: String, cseq: u32, method: Method },
}

impl std::fmt::Display for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tid::Branch { branch, method } => write!(f, "{}/{}", branch, method),
            Tid::CallSeq {
                call_id,
                cseq,
                method,
            } => write!(f, "{} {}/{}", call_id, cseq, method),
        }
    }
}

impl Tid {
    /// RFC 3261 identity from the top Via branch; falls back to the
    /// `CallSeq` profile when the peer sent no branch parameter.
    pub fn from_msg(msg: &SipMessage) -> Result<Self> {
        let (via, method) = match msg {
            SipMessage::Request(req) => (req.via_header()?, req.method.clone()),
            SipMessage::Response(resp) => (resp.via_header()?, resp.cseq_header()?.method()?),
        };
        match via.typed()?.branch() {
            Some(branch) => Ok(Tid::Branch {
                branch: branch.to_string(),
                method,
            }),
            None => Tid::call_seq(msg),
        }
    }

    /// `(Call-ID, CSeq)` identity, independent of Via headers.
    pub fn call_seq(msg: &SipMessage) -> Result<Self> {
        let (call_id, cseq) = match msg {
            SipMessage::Request(req) => (req.call_id_header()?, req.cseq_header()?),
            SipMessage::Response(resp) => (resp.call_id_header()?, resp.cseq_header()?),
        };
        Ok(Tid::CallSeq {
            call_id: call_id.value().to_string(),
            cseq: cseq.seq()?,
            method: cseq.method()?,
        })
    }
}

pub fn call_id_of(msg: &SipMessage) -> Result<String> {
    let header = match msg {
        SipMessage::Request(req) => req.call_id_header()?,
        SipMessage::Response(resp) => resp.call_id_header()?,
    };
    Ok(header.value().to_string())
}

pub fn cseq_method_of(msg: &SipMessage) -> Result<Method> {
    let cseq = match msg {
        SipMessage::Request(req) => req.cseq_header()?,
        SipMessage::Response(resp) => resp.cseq_header()?,
    };
    cseq.method().map_err(Into::into)
}

/// Response construction: keep the headers the response must echo, append
/// whatever the caller adds.
pub fn make_response(
    req: &Request,
    status_code: StatusCode,
    extra: Vec<Header>,
    body: Option<Vec<u8>>,
) -> Response {
    let mut headers = req.headers.clone();
    headers.retain(|h| {
        matches!(
            h,
            Header::Via(_)
                | Header::CallId(_)
                | Header::From(_)
                | Header::To(_)
                | Header::CSeq(_)
                | Header::MaxForwards(_)
        )
    });
    for h in extra {
        headers.push(h);
    }
    Response {
        status_code,
        version: req.version.clone(),
        headers,
        body: body.unwrap_or_default(),
    }
}

pub fn random_text(count: usize) -> String {
    use rand::Rng;
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(count)
        .map(char::from)
        .collect::<String>()
}

/// Stable per-transaction suffix: retransmits of the same packet must
/// reuse the exact branch their first transmission carried.
pub fn branch_nonce(msg: &SipMessage) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    if let Ok(call_id) = call_id_of(msg) {
        call_id.hash(&mut hasher);
    }
    if let Ok(tid) = Tid::call_seq(msg) {
        tid.to_string().hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}
