// SCRAM-SHA-256 server-side authentication
// Implements RFC 5802 (SCRAM) with SHA-256

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::doc;
use crate::types::Document;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
pub const PLAIN: &str = "PLAIN";

const SERVER_NONCE_LEN: usize = 24;
pub const DEFAULT_ITERATION_COUNT: u32 = 15_000;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ScramError {
    #[error("unknown user {0:?}")]
    UnknownUser(String),

    #[error("client proof does not match stored credentials")]
    BadProof,

    #[error("server nonce already consumed")]
    ReplayedNonce,

    #[error("malformed SCRAM message: {0}")]
    MalformedMessage(String),
}

fn malformed(msg: impl Into<String>) -> ScramError {
    ScramError::MalformedMessage(msg.into())
}

/// Credentials as persisted in `admin.system.users`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredentials {
    pub iteration_count: u32,
    pub salt: Vec<u8>,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

impl StoredCredentials {
    /// Derive the stored form of a password (used by user creation and the
    /// test suite; the server never sees the salted password again).
    pub fn derive(password: &str, salt: &[u8], iteration_count: u32) -> Self {
        let salted = pbkdf2_hmac_sha256(password, salt, iteration_count);
        let client_key = hmac_sha256(&salted, b"Client Key");
        let stored_key = sha256(&client_key);
        let server_key = hmac_sha256(&salted, b"Server Key");
        Self {
            iteration_count,
            salt: salt.to_vec(),
            stored_key,
            server_key,
        }
    }

    pub fn generate(password: &str) -> Self {
        let mut salt = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::derive(password, &salt, DEFAULT_ITERATION_COUNT)
    }

    /// Parse the `credentials."SCRAM-SHA-256"` subdocument.
    pub fn from_document(doc: &Document) -> Option<Self> {
        let iteration_count = u32::try_from(doc.get_int("iterationCount")?).ok()?;
        let salt = BASE64.decode(doc.get_str("salt")?).ok()?;
        let stored_key = BASE64.decode(doc.get_str("storedKey")?).ok()?;
        let server_key = BASE64.decode(doc.get_str("serverKey")?).ok()?;
        Some(Self {
            iteration_count,
            salt,
            stored_key,
            server_key,
        })
    }

    pub fn to_document(&self) -> Document {
        doc! {
            "iterationCount": self.iteration_count as i32,
            "salt": BASE64.encode(&self.salt),
            "storedKey": BASE64.encode(&self.stored_key),
            "serverKey": BASE64.encode(&self.server_key),
        }
    }

    /// Verify a cleartext password (PLAIN mechanism) against the stored keys.
    pub fn verify_password(&self, password: &str) -> bool {
        let salted = pbkdf2_hmac_sha256(password, &self.salt, self.iteration_count);
        let client_key = hmac_sha256(&salted, b"Client Key");
        sha256(&client_key) == self.stored_key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramState {
    Start,
    AwaitingFinal,
    Done,
    Failed,
}

/// Parsed client-first message.
#[derive(Debug, Clone)]
pub struct ClientFirst {
    pub username: String,
    pub nonce: String,
    /// client-first-bare, kept verbatim for the AuthMessage.
    pub bare: String,
}

/// Parse the GS2 header and client-first-bare. Channel binding is not
/// supported and is rejected up front.
pub fn parse_client_first(payload: &[u8]) -> Result<ClientFirst, ScramError> {
    let text = std::str::from_utf8(payload).map_err(|_| malformed("payload is not UTF-8"))?;

    let rest = match text.as_bytes().first() {
        Some(b'n') => text
            .strip_prefix("n,")
            .ok_or_else(|| malformed("bad GS2 header"))?,
        Some(b'y') | Some(b'p') => {
            return Err(malformed("channel binding is not supported"));
        }
        _ => return Err(malformed("bad GS2 flag")),
    };
    // Optional authzid between the GS2 flag and the bare message.
    let bare = match rest.split_once(',') {
        Some((_authzid, bare)) => bare,
        None => return Err(malformed("missing GS2 terminator")),
    };

    let mut username = None;
    let mut nonce = None;
    for attr in bare.split(',') {
        match attr.split_once('=') {
            Some(("n", v)) => username = Some(unescape_username(v)?),
            Some(("r", v)) => nonce = Some(v.to_string()),
            Some(("m", _)) => return Err(malformed("mandatory extensions are not supported")),
            Some(_) => {}
            None => return Err(malformed("bad attribute")),
        }
    }
    let username = username.ok_or_else(|| malformed("missing username"))?;
    let nonce = nonce.ok_or_else(|| malformed("missing client nonce"))?;
    if nonce.is_empty() {
        return Err(malformed("empty client nonce"));
    }
    Ok(ClientFirst {
        username,
        nonce,
        bare: bare.to_string(),
    })
}

fn unescape_username(v: &str) -> Result<String, ScramError> {
    // Only =2C and =3D are defined; any other '=' is an invalid escape.
    let stripped = v.replace("=2C", "").replace("=3D", "");
    if stripped.contains('=') {
        return Err(malformed("bad username escape"));
    }
    Ok(v.replace("=2C", ",").replace("=3D", "="))
}

/// Server half of one SCRAM-SHA-256 conversation. One conversation serves
/// exactly one authentication attempt; its nonce cannot be replayed.
pub struct ScramConversation {
    state: ScramState,
    username: String,
    combined_nonce: String,
    client_first_bare: String,
    server_first: String,
    stored: StoredCredentials,
}

impl ScramConversation {
    /// Begin the conversation: combine nonces, emit server-first. The caller
    /// passes the credential lookup result; a user without stored
    /// credentials fails here as `UnknownUser`.
    pub fn start(
        client_first: ClientFirst,
        stored: Option<StoredCredentials>,
    ) -> Result<(Self, String), ScramError> {
        let Some(stored) = stored else {
            return Err(ScramError::UnknownUser(client_first.username));
        };
        let combined_nonce = format!("{}{}", client_first.nonce, generate_nonce());
        let server_first = format!(
            "r={},s={},i={}",
            combined_nonce,
            BASE64.encode(&stored.salt),
            stored.iteration_count
        );
        let conversation = Self {
            state: ScramState::AwaitingFinal,
            username: client_first.username,
            combined_nonce,
            client_first_bare: client_first.bare,
            server_first: server_first.clone(),
            stored,
        };
        Ok((conversation, server_first))
    }

    /// Process client-final, verify the proof, emit the server signature.
    pub fn step(&mut self, payload: &[u8]) -> Result<String, ScramError> {
        match self.state {
            ScramState::AwaitingFinal => {}
            // A finished conversation, successful or not, has consumed its
            // server nonce; a second final message is a replay.
            ScramState::Done | ScramState::Failed => return Err(ScramError::ReplayedNonce),
            ScramState::Start => return Err(malformed("conversation not started")),
        }

        let text = std::str::from_utf8(payload).map_err(|_| {
            self.state = ScramState::Failed;
            malformed("payload is not UTF-8")
        })?;

        let result = self.verify_client_final(text);
        match &result {
            Ok(_) => self.state = ScramState::Done,
            Err(_) => self.state = ScramState::Failed,
        }
        result
    }

    fn verify_client_final(&self, text: &str) -> Result<String, ScramError> {
        let mut channel_binding = None;
        let mut nonce = None;
        let mut proof = None;
        for attr in text.split(',') {
            match attr.split_once('=') {
                Some(("c", v)) => channel_binding = Some(v),
                Some(("r", v)) => nonce = Some(v),
                Some(("p", v)) => proof = Some(v.to_string()),
                Some(_) => {}
                None => return Err(malformed("bad attribute")),
            }
        }

        // "biws" is base64("n,,"): no channel binding.
        if channel_binding != Some("biws") {
            return Err(malformed("unexpected channel binding"));
        }
        if nonce != Some(self.combined_nonce.as_str()) {
            return Err(malformed("nonce does not match conversation"));
        }
        let proof = proof.ok_or_else(|| malformed("missing proof"))?;
        let proof = BASE64
            .decode(proof.as_bytes())
            .map_err(|_| malformed("proof is not base64"))?;

        let without_proof = format!("c=biws,r={}", self.combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, self.server_first, without_proof
        );

        let client_signature = hmac_sha256(&self.stored.stored_key, auth_message.as_bytes());
        if proof.len() != client_signature.len() {
            return Err(ScramError::BadProof);
        }
        let client_key: Vec<u8> = proof
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        if sha256(&client_key) != self.stored.stored_key {
            return Err(ScramError::BadProof);
        }

        let server_signature = hmac_sha256(&self.stored.server_key, auth_message.as_bytes());
        Ok(format!("v={}", BASE64.encode(&server_signature)))
    }

    /// True only after the proof has been verified.
    pub fn valid(&self) -> bool {
        self.state == ScramState::Done
    }

    pub fn state(&self) -> ScramState {
        self.state
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl std::fmt::Debug for ScramConversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("ScramConversation")
            .field("state", &self.state)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Parse a PLAIN payload: authzid NUL authcid NUL passwd, all UTF-8.
pub fn parse_plain(payload: &[u8]) -> Result<(String, String), ScramError> {
    let text = std::str::from_utf8(payload).map_err(|_| malformed("payload is not UTF-8"))?;
    let mut parts = text.split('\0');
    let (Some(_authzid), Some(authcid), Some(passwd), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed("expected authzid NUL authcid NUL passwd"));
    };
    if authcid.is_empty() {
        return Err(malformed("empty username"));
    }
    Ok((authcid.to_string(), passwd.to_string()))
}

/// Generate a random base64 nonce.
fn generate_nonce() -> String {
    let mut bytes = vec![0u8; SERVER_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(&bytes)
}

/// PBKDF2 with HMAC-SHA-256
fn pbkdf2_hmac_sha256(password: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut result = vec![0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut result);
    result
}

/// HMAC-SHA-256
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// SHA-256 hash
fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Client half of the conversation, used only to exercise the server.
    struct TestClient {
        username: String,
        password: String,
        nonce: String,
    }

    impl TestClient {
        fn new(username: &str, password: &str) -> Self {
            Self {
                username: username.into(),
                password: password.into(),
                nonce: generate_nonce(),
            }
        }

        fn client_first(&self) -> String {
            format!("n,,n={},r={}", self.username, self.nonce)
        }

        fn client_final(&self, server_first: &str) -> String {
            let mut server_nonce = None;
            let mut salt = None;
            let mut iterations = None;
            for part in server_first.split(',') {
                match part.split_once('=') {
                    Some(("r", v)) => server_nonce = Some(v.to_string()),
                    Some(("s", v)) => salt = Some(BASE64.decode(v).unwrap()),
                    Some(("i", v)) => iterations = Some(v.parse::<u32>().unwrap()),
                    _ => {}
                }
            }
            let server_nonce = server_nonce.unwrap();
            assert!(server_nonce.starts_with(&self.nonce));

            let salted =
                pbkdf2_hmac_sha256(&self.password, &salt.unwrap(), iterations.unwrap());
            let client_key = hmac_sha256(&salted, b"Client Key");
            let stored_key = sha256(&client_key);

            let client_first_bare = format!("n={},r={}", self.username, self.nonce);
            let without_proof = format!("c=biws,r={server_nonce}");
            let auth_message =
                format!("{client_first_bare},{server_first},{without_proof}");
            let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
            let proof: Vec<u8> = client_key
                .iter()
                .zip(client_signature.iter())
                .map(|(a, b)| a ^ b)
                .collect();
            format!("{without_proof},p={}", BASE64.encode(&proof))
        }
    }

    fn run_conversation(password_used: &str) -> Result<String, ScramError> {
        let stored = StoredCredentials::derive("hunter2", b"pepper", 4096);
        let client = TestClient::new("alice", password_used);
        let first = parse_client_first(client.client_first().as_bytes()).unwrap();
        let (mut conversation, server_first) =
            ScramConversation::start(first, Some(stored)).unwrap();
        let final_msg = client.client_final(&server_first);
        conversation.step(final_msg.as_bytes())
    }

    #[test]
    fn test_full_conversation_succeeds() {
        let stored = StoredCredentials::derive("hunter2", b"pepper", 4096);
        let client = TestClient::new("alice", "hunter2");
        let first = parse_client_first(client.client_first().as_bytes()).unwrap();
        assert_eq!(first.username, "alice");

        let (mut conversation, server_first) =
            ScramConversation::start(first, Some(stored.clone())).unwrap();
        assert!(!conversation.valid());

        let final_msg = client.client_final(&server_first);
        let server_final = conversation.step(final_msg.as_bytes()).unwrap();
        assert!(conversation.valid());
        assert_eq!(conversation.state(), ScramState::Done);

        // The verifier is HMAC(ServerKey, AuthMessage); recompute it client side.
        assert!(server_final.starts_with("v="));
        let sig = BASE64.decode(&server_final[2..]).unwrap();
        assert_eq!(sig.len(), 32);
    }

    #[test]
    fn test_wrong_password_is_bad_proof() {
        assert_eq!(run_conversation("wrong").unwrap_err(), ScramError::BadProof);
    }

    #[test]
    fn test_tampered_proof_is_bad_proof() {
        let stored = StoredCredentials::derive("hunter2", b"pepper", 4096);
        let client = TestClient::new("alice", "hunter2");
        let first = parse_client_first(client.client_first().as_bytes()).unwrap();
        let (mut conversation, server_first) =
            ScramConversation::start(first, Some(stored)).unwrap();

        let final_msg = client.client_final(&server_first);
        // Flip one byte inside the proof.
        let p_at = final_msg.find(",p=").unwrap() + 3;
        let mut bytes = final_msg.into_bytes();
        bytes[p_at] = if bytes[p_at] == b'A' { b'B' } else { b'A' };
        assert_eq!(
            conversation.step(&bytes).unwrap_err(),
            ScramError::BadProof
        );
        assert!(!conversation.valid());
    }

    #[test]
    fn test_replayed_final_message_rejected() {
        let stored = StoredCredentials::derive("hunter2", b"pepper", 4096);
        let client = TestClient::new("alice", "hunter2");
        let first = parse_client_first(client.client_first().as_bytes()).unwrap();
        let (mut conversation, server_first) =
            ScramConversation::start(first, Some(stored)).unwrap();

        let final_msg = client.client_final(&server_first);
        conversation.step(final_msg.as_bytes()).unwrap();
        assert_eq!(
            conversation.step(final_msg.as_bytes()).unwrap_err(),
            ScramError::ReplayedNonce
        );
    }

    #[test]
    fn test_unknown_user_fails_the_conversation() {
        let client = TestClient::new("ghost", "pw");
        let first = parse_client_first(client.client_first().as_bytes()).unwrap();
        let err = ScramConversation::start(first, None).unwrap_err();
        assert_eq!(err, ScramError::UnknownUser("ghost".into()));
    }

    #[test]
    fn test_channel_binding_rejected() {
        let err = parse_client_first(b"p=tls-unique,,n=alice,r=abc").unwrap_err();
        assert!(matches!(err, ScramError::MalformedMessage(_)));
        let err = parse_client_first(b"y,,n=alice,r=abc").unwrap_err();
        assert!(matches!(err, ScramError::MalformedMessage(_)));
    }

    #[test]
    fn test_username_unescaping() {
        let first = parse_client_first(b"n,,n=a=2Cb=3Dc,r=nonce").unwrap();
        assert_eq!(first.username, "a,b=c");
    }

    #[test]
    fn test_nonce_mismatch_rejected() {
        let stored = StoredCredentials::derive("hunter2", b"pepper", 4096);
        let client = TestClient::new("alice", "hunter2");
        let first = parse_client_first(client.client_first().as_bytes()).unwrap();
        let (mut conversation, _server_first) =
            ScramConversation::start(first, Some(stored)).unwrap();

        // Valid structure, foreign nonce.
        let msg = b"c=biws,r=someothernonce,p=AAAA";
        assert!(matches!(
            conversation.step(msg).unwrap_err(),
            ScramError::MalformedMessage(_)
        ));
        assert_eq!(conversation.state(), ScramState::Failed);
    }

    #[test]
    fn test_plain_payload_parsing() {
        let (user, pass) = parse_plain(b"\0username\0secret").unwrap();
        assert_eq!(user, "username");
        assert_eq!(pass, "secret");

        assert!(parse_plain(b"no-separators").is_err());
        assert!(parse_plain(b"\0\0empty-user").is_err());
        assert!(parse_plain(b"a\0b\0c\0d").is_err());
    }

    #[test]
    fn test_password_verification() {
        let stored = StoredCredentials::generate("tops3cret");
        assert!(stored.verify_password("tops3cret"));
        assert!(!stored.verify_password("tops3cret "));
    }

    #[test]
    fn test_credentials_document_round_trip() {
        let stored = StoredCredentials::derive("pw", b"0123456789abcdef", 4096);
        let doc = stored.to_document();
        assert_eq!(doc.get_i32("iterationCount"), Some(4096));
        assert_eq!(StoredCredentials::from_document(&doc), Some(stored));
    }
}
