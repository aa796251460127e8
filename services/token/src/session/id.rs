use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;

pub struct SessionIdGenerator;

impl SessionIdGenerator {
    /// 256 random bits, URL-safe.
    pub fn generate() -> String {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; 32] = rng.gen();
        URL_SAFE_NO_PAD.encode(random_bytes)
    }

    /// Unique id for an individual token (`jti`).
    pub fn generate_token_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
