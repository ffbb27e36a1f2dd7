//! The built-in `dxos.protocol.init` veto gate (spec.md §4.3).
//!
//! Every session opens this extension first and drives a tiny three-symbol
//! mini-protocol over it (`valid` / `invalid` / `destroy`) before any other
//! extension sees `onHandshake`. A local or remote `invalid`/`destroy`
//! tears the whole session down with `ERR_PROTOCOL_CONNECTION_INVALID`,
//! mirroring the teacher's `StaticKeyAuthenticator`/`Ed25519Authenticator`
//! accept-or-reject gate ahead of `AlnpSession::accept`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::codec::{CodecError, Schema};
use crate::error::ProtocolError;
use crate::extension::Extension;

pub const INIT_EXTENSION_NAME: &str = "dxos.protocol.init";

const TYPE_URL: &str = "dxos.protocol.init.Symbol";

/// The three literal ASCII tokens exchanged on the init-gate channel
/// (spec.md §6.3) — not CBOR-wrapped like a regular structured payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitSymbol {
    Valid,
    Invalid,
    Destroy,
}

impl Schema for InitSymbol {
    fn type_url(&self) -> &str {
        TYPE_URL
    }

    fn encode_value(&self) -> Result<Vec<u8>, CodecError> {
        Ok(match self {
            InitSymbol::Valid => b"valid".to_vec(),
            InitSymbol::Invalid => b"invalid".to_vec(),
            InitSymbol::Destroy => b"destroy".to_vec(),
        })
    }

    fn decode_value(_type_url: &str, bytes: &[u8]) -> Result<Option<Self>, CodecError> {
        Ok(match bytes {
            b"valid" => Some(InitSymbol::Valid),
            b"invalid" => Some(InitSymbol::Invalid),
            b"destroy" => Some(InitSymbol::Destroy),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Pending,
    Valid,
    Rejected,
}

struct State {
    verdict: Verdict,
}

/// The local handle a [`crate::session::Session`] uses to gate its own
/// lifecycle on the peer's (and its own) init verdict.
pub struct InitExtension {
    extension: Extension<InitSymbol>,
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl InitExtension {
    pub fn new() -> Self {
        let extension = Extension::new(INIT_EXTENSION_NAME);
        let state = Arc::new(Mutex::new(State {
            verdict: Verdict::Pending,
        }));
        let notify = Arc::new(Notify::new());

        let state_for_handler = state.clone();
        let notify_for_handler = notify.clone();
        extension.set_on_message(move |_session, data, _options| {
            let state = state_for_handler.clone();
            let notify = notify_for_handler.clone();
            async move {
                match data {
                    InitSymbol::Valid => {
                        let mut state = state.lock();
                        if state.verdict == Verdict::Pending {
                            state.verdict = Verdict::Valid;
                        }
                    }
                    InitSymbol::Invalid | InitSymbol::Destroy => {
                        state.lock().verdict = Verdict::Rejected;
                    }
                }
                notify.notify_waiters();
                Ok(None)
            }
        });

        let state_for_close = state.clone();
        let notify_for_close = notify.clone();
        extension.set_on_close(move |_err| {
            let state = state_for_close.clone();
            let notify = notify_for_close.clone();
            async move {
                state.lock().verdict = Verdict::Rejected;
                notify.notify_waiters();
            }
        });

        InitExtension {
            extension,
            state,
            notify,
        }
    }

    pub fn extension(&self) -> Extension<InitSymbol> {
        self.extension.clone()
    }

    /// Sends `valid` to the peer and awaits the peer's own verdict (or
    /// `timeout`). Resolves to `true` iff the peer's verdict was `valid`;
    /// a timeout resolves to `false` rather than erroring, matching
    /// spec.md §4.3's `continue()`.
    pub async fn continue_gate(&self, timeout: Duration) -> Result<bool, ProtocolError> {
        self.extension.notify(InitSymbol::Valid).await?;
        match tokio::time::timeout(timeout, self.raw_wait()).await {
            Ok(Verdict::Valid) => Ok(true),
            Ok(_) => Ok(false),
            Err(_) => Ok(false),
        }
    }

    /// Idempotent: sends `invalid` then, best-effort, `destroy`, matching
    /// spec.md §4.3's `break()`.
    pub async fn break_gate(&self) {
        self.state.lock().verdict = Verdict::Rejected;
        let _ = self.extension.notify(InitSymbol::Invalid).await;
        let _ = self.extension.notify(InitSymbol::Destroy).await;
    }

    /// Records a local veto without sending anything, for callers that have
    /// already decided the session is invalid before the extension opened.
    pub fn reject_locally(&self) {
        self.state.lock().verdict = Verdict::Rejected;
        self.notify.notify_waiters();
    }

    async fn raw_wait(&self) -> Verdict {
        loop {
            {
                let verdict = self.state.lock().verdict;
                if verdict != Verdict::Pending {
                    return verdict;
                }
            }
            self.notify.notified().await;
        }
    }
}

impl Default for InitExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::ExtensionObject;
    use crate::session::{Session, SessionOptions};
    use crate::transport::PipeTransport;

    async fn opened_init_extension() -> InitExtension {
        let (a, _b) = PipeTransport::pair();
        let session = Session::new(a, SessionOptions::default());
        let init = InitExtension::new();
        init.extension().open(session).await.unwrap();
        init
    }

    #[tokio::test]
    async fn continue_gate_times_out_to_false_without_peer_response() {
        let init = opened_init_extension().await;
        let result = init.continue_gate(Duration::from_millis(50)).await.unwrap();
        assert!(!result);
    }

    #[tokio::test]
    async fn reject_locally_short_circuits_continue_gate() {
        let init = opened_init_extension().await;
        init.reject_locally();
        let result = init.continue_gate(Duration::from_millis(200)).await.unwrap();
        assert!(!result);
    }

    #[test]
    fn symbols_round_trip_through_literal_ascii() {
        for symbol in [InitSymbol::Valid, InitSymbol::Invalid, InitSymbol::Destroy] {
            let bytes = symbol.encode_value().unwrap();
            let decoded = InitSymbol::decode_value(TYPE_URL, &bytes).unwrap().unwrap();
            assert_eq!(decoded, symbol);
        }
    }
}
