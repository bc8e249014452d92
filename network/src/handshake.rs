//! Mutual identity handshake.
//!
//! Each side challenges the other with a random cookie bound to the
//! remote endpoint; a peer proves its node id by signing the cookie it was
//! sent. Cookies expire and are capped in number, so a peer cannot harvest
//! signatures without answering from the address it claims.
//!
//! State machine per channel: `None → SentQuery → SentResponse → Live`.
//! Any verification failure drops the channel.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use strand_messages::{HandshakeResponse, Message};
use strand_types::{keys, Account, Endpoint, KeyPair};

use crate::NetworkError;

/// Outstanding cookies, keyed by the endpoint they were issued to.
pub struct CookieJar {
    pending: HashMap<Endpoint, CookieEntry>,
    max_pending: usize,
    ttl: Duration,
}

struct CookieEntry {
    cookie: [u8; 32],
    issued_at: Instant,
}

impl CookieJar {
    pub fn new(max_pending: usize, ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            max_pending,
            ttl,
        }
    }

    /// Issue a cookie for `endpoint`. Returns `None` at capacity.
    pub fn issue(&mut self, endpoint: Endpoint) -> Option<[u8; 32]> {
        self.purge_expired();
        if self.pending.len() >= self.max_pending && !self.pending.contains_key(&endpoint) {
            return None;
        }
        let mut cookie = [0u8; 32];
        getrandom::getrandom(&mut cookie).ok()?;
        self.pending.insert(
            endpoint,
            CookieEntry {
                cookie,
                issued_at: Instant::now(),
            },
        );
        Some(cookie)
    }

    /// Consume the cookie issued to `endpoint`, if still valid.
    pub fn take(&mut self, endpoint: &Endpoint) -> Option<[u8; 32]> {
        let entry = self.pending.remove(endpoint)?;
        if entry.issued_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.cookie)
    }

    pub fn purge_expired(&mut self) {
        let ttl = self.ttl;
        self.pending.retain(|_, e| e.issued_at.elapsed() <= ttl);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Progress of the handshake on one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    None,
    SentQuery,
    SentResponse,
    Live,
}

/// Drives one channel's handshake. The FSM owns no I/O: callers feed it
/// received `node_id_handshake` payloads and send whatever it returns.
pub struct HandshakeFsm {
    state: HandshakeState,
    remote: Endpoint,
    /// Node id of the peer once its signature over our cookie verified.
    verified_node_id: Option<Account>,
}

impl HandshakeFsm {
    pub fn new(remote: Endpoint) -> Self {
        Self {
            state: HandshakeState::None,
            remote,
            verified_node_id: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == HandshakeState::Live
    }

    /// The peer's proven identity; set once `Live`.
    pub fn node_id(&self) -> Option<Account> {
        self.verified_node_id
    }

    /// Open the handshake as initiator.
    pub fn initiate(&mut self, jar: &mut CookieJar) -> Result<Message, NetworkError> {
        if self.state != HandshakeState::None {
            return Err(NetworkError::Handshake("initiate on active handshake"));
        }
        let cookie = jar
            .issue(self.remote)
            .ok_or(NetworkError::Handshake("cookie jar at capacity"))?;
        self.state = HandshakeState::SentQuery;
        Ok(Message::NodeIdHandshake {
            query: Some(cookie),
            response: None,
        })
    }

    /// Feed a received `node_id_handshake`. Returns the reply to send, if
    /// any. An `Err` means the channel must be dropped.
    pub fn receive(
        &mut self,
        query: Option<[u8; 32]>,
        response: Option<HandshakeResponse>,
        local_key: &KeyPair,
        jar: &mut CookieJar,
    ) -> Result<Option<Message>, NetworkError> {
        // Verify any response first: it must sign the cookie we issued to
        // this endpoint.
        if let Some(response) = &response {
            let cookie = jar
                .take(&self.remote)
                .ok_or(NetworkError::Handshake("no cookie outstanding"))?;
            if !keys::verify_signature(&cookie, &response.signature, &response.node_id) {
                return Err(NetworkError::Handshake("cookie signature invalid"));
            }
            self.verified_node_id = Some(response.node_id);
        }

        match (self.state, query, response.is_some()) {
            // Responder: fresh query arrives. Answer it and challenge back.
            (HandshakeState::None, Some(their_cookie), false) => {
                let our_cookie = jar
                    .issue(self.remote)
                    .ok_or(NetworkError::Handshake("cookie jar at capacity"))?;
                self.state = HandshakeState::SentResponse;
                Ok(Some(Message::NodeIdHandshake {
                    query: Some(our_cookie),
                    response: Some(HandshakeResponse {
                        node_id: local_key.account,
                        signature: keys::sign_message(&their_cookie, &local_key.private),
                    }),
                }))
            }
            // Initiator: the responder answered our query and challenged us.
            (HandshakeState::SentQuery, Some(their_cookie), true) => {
                self.state = HandshakeState::Live;
                Ok(Some(Message::NodeIdHandshake {
                    query: None,
                    response: Some(HandshakeResponse {
                        node_id: local_key.account,
                        signature: keys::sign_message(&their_cookie, &local_key.private),
                    }),
                }))
            }
            // Responder: the initiator's closing response.
            (HandshakeState::SentResponse, None, true) => {
                self.state = HandshakeState::Live;
                Ok(None)
            }
            _ => Err(NetworkError::Handshake("handshake message out of order")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jar() -> CookieJar {
        CookieJar::new(64, Duration::from_secs(30))
    }

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::loopback(port)
    }

    fn unpack(message: Message) -> (Option<[u8; 32]>, Option<HandshakeResponse>) {
        match message {
            Message::NodeIdHandshake { query, response } => (query, response),
            other => panic!("expected NodeIdHandshake, got {other:?}"),
        }
    }

    /// Runs the full three-message exchange between two peers.
    fn run_mutual() -> (HandshakeFsm, HandshakeFsm, KeyPair, KeyPair) {
        let key_a = KeyPair::from_seed(&[1u8; 32]);
        let key_b = KeyPair::from_seed(&[2u8; 32]);
        let mut jar_a = jar();
        let mut jar_b = jar();
        // A sees B at :7001, B sees A at :7000.
        let mut fsm_a = HandshakeFsm::new(endpoint(7001));
        let mut fsm_b = HandshakeFsm::new(endpoint(7000));

        let msg1 = fsm_a.initiate(&mut jar_a).unwrap();
        let (q1, r1) = unpack(msg1);
        let msg2 = fsm_b.receive(q1, r1, &key_b, &mut jar_b).unwrap().unwrap();
        let (q2, r2) = unpack(msg2);
        let msg3 = fsm_a.receive(q2, r2, &key_a, &mut jar_a).unwrap().unwrap();
        let (q3, r3) = unpack(msg3);
        let done = fsm_b.receive(q3, r3, &key_b, &mut jar_b).unwrap();
        assert!(done.is_none());

        (fsm_a, fsm_b, key_a, key_b)
    }

    #[test]
    fn mutual_handshake_reaches_live_on_both_sides() {
        let (fsm_a, fsm_b, key_a, key_b) = run_mutual();
        assert!(fsm_a.is_live());
        assert!(fsm_b.is_live());
        assert_eq!(fsm_a.node_id(), Some(key_b.account));
        assert_eq!(fsm_b.node_id(), Some(key_a.account));
    }

    #[test]
    fn forged_response_drops_channel() {
        let key_a = KeyPair::from_seed(&[1u8; 32]);
        let mallory = KeyPair::from_seed(&[3u8; 32]);
        let mut jar_a = jar();
        let mut fsm_a = HandshakeFsm::new(endpoint(7001));

        let (q1, _) = unpack(fsm_a.initiate(&mut jar_a).unwrap());
        let _their_cookie = q1.unwrap();
        // Mallory signs garbage instead of our cookie.
        let response = HandshakeResponse {
            node_id: mallory.account,
            signature: keys::sign_message(b"not-the-cookie", &mallory.private),
        };
        let result = fsm_a.receive(Some([9u8; 32]), Some(response), &key_a, &mut jar_a);
        assert!(result.is_err());
        assert!(!fsm_a.is_live());
    }

    #[test]
    fn response_without_outstanding_cookie_rejected() {
        let key_a = KeyPair::from_seed(&[1u8; 32]);
        let key_b = KeyPair::from_seed(&[2u8; 32]);
        let mut jar_a = jar();
        let mut fsm_a = HandshakeFsm::new(endpoint(7001));
        // No initiate(): nothing outstanding for this endpoint.
        let response = HandshakeResponse {
            node_id: key_b.account,
            signature: keys::sign_message(&[0u8; 32], &key_b.private),
        };
        assert!(fsm_a
            .receive(None, Some(response), &key_a, &mut jar_a)
            .is_err());
    }

    #[test]
    fn out_of_order_query_rejected() {
        let key_a = KeyPair::from_seed(&[1u8; 32]);
        let mut jar_a = jar();
        let mut fsm_a = HandshakeFsm::new(endpoint(7001));
        fsm_a.initiate(&mut jar_a).unwrap();
        // A bare query while we await a response is a protocol violation.
        assert!(fsm_a
            .receive(Some([1u8; 32]), None, &key_a, &mut jar_a)
            .is_err());
    }

    #[test]
    fn cookie_jar_caps_and_expires() {
        let mut jar = CookieJar::new(2, Duration::from_secs(30));
        assert!(jar.issue(endpoint(1)).is_some());
        assert!(jar.issue(endpoint(2)).is_some());
        assert!(jar.issue(endpoint(3)).is_none());
        // Re-issuing for a known endpoint replaces rather than grows.
        assert!(jar.issue(endpoint(1)).is_some());
        assert_eq!(jar.pending_count(), 2);

        let mut fast = CookieJar::new(2, Duration::from_millis(0));
        fast.issue(endpoint(9));
        std::thread::sleep(Duration::from_millis(5));
        assert!(fast.take(&endpoint(9)).is_none());
    }

    #[test]
    fn cookie_bound_to_endpoint() {
        let mut jar = jar();
        jar.issue(endpoint(1)).unwrap();
        assert!(jar.take(&endpoint(2)).is_none());
        assert!(jar.take(&endpoint(1)).is_some());
        // Consumed.
        assert!(jar.take(&endpoint(1)).is_none());
    }
}
