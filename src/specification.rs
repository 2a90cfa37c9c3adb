//! The informal description of the roamwire wire formats.

// OBFS hello (first datagram of a flow, both directions):
// ```text
// | nonce | enc_pk | padding  |
// |  32B  |  48B   | 0..=999B |
// ```
// `enc_pk` is the 32-byte X25519 public key sealed with ChaCha20-Poly1305
// under `HMAC(now_cookie, nonce)` and an all-zero nonce.
pub(crate) const HELLO_NONCE_LEN: usize = 32;
pub(crate) const HELLO_ENC_PK_LEN: usize = 32 + AEAD_TAG_LEN; // 48
pub(crate) const HELLO_MIN_LEN: usize = HELLO_NONCE_LEN + HELLO_ENC_PK_LEN; // 80
pub(crate) const HELLO_PADDING_MAX_LEN: usize = 999;

/// Length of a cookie time bucket in seconds.
pub(crate) const COOKIE_BUCKET_SECS: u64 = 30;

/// Buckets accepted on each side of the current one.
pub(crate) const COOKIE_SKEW_BUCKETS: i64 = 3;

// OBFS data packet:
// ```text
// | nonce | ciphertext | tag |
// |  24B  |  variable  | 16B |
// ```
pub(crate) const XNONCE_LEN: usize = 24;
pub(crate) const DATA_MIN_LEN: usize = XNONCE_LEN + AEAD_TAG_LEN; // 40

/// Datagrams are received into buffers of this size.
pub(crate) const MAX_DATAGRAM_LEN: usize = 2048;

pub(crate) const AEAD_TAG_LEN: usize = 16;

// E2E packet (inside an OBFS payload, integers big-endian):
// ```text
// | session | sn | ack | body_len | body     | pad_len | padding  |
// |   16B   | 8B |  8B |    2B    | variable |    2B   | variable |
// ```
pub(crate) const SESSION_ADDR_LEN: usize = 16;
pub(crate) const E2E_HDR_LEN: usize = SESSION_ADDR_LEN + 8 + 8; // 32
pub(crate) const E2E_MIN_LEN: usize = E2E_HDR_LEN + 2 + 2; // 36

/// Size of the per-link send timestamp ring.
pub(crate) const SEND_TIMES_LEN: usize = 1024;

/// Number of recent body hashes remembered for deduplication.
pub(crate) const DEDUP_WINDOW: usize = 128;

/// Ping assumed for a link that has never been measured, in milliseconds.
pub(crate) const UNKNOWN_PING_MS: f64 = 10_000_000.0;

/// RTT samples at or above this many milliseconds are discarded.
pub(crate) const MAX_PING_SAMPLE_MS: u64 = 1000;

/// Lower bound of the ping term in the path score, in milliseconds.
pub(crate) const MIN_SCORE_PING_MS: f64 = 50.0;

// TinySS handshake (each direction):
// ```text
// | "TinySS-1" | epk |
// |     8B     | 32B |
// ```
//
// TinySS record:
// ```text
// | len | ciphertext | tag |
// |  2B | <= 32768B  | 16B |
// |     | <-   len bytes -> |
// ```
pub(crate) const TSS_MAGIC: &[u8; 8] = b"TinySS-1";
pub(crate) const TSS_HANDSHAKE_LEN: usize = TSS_MAGIC.len() + 32; // 40
pub(crate) const TSS_LEN_FIELD: usize = 2;
pub(crate) const TSS_MAX_PLAINTEXT: usize = 32 * 1024;
pub(crate) const TSS_MAX_CIPHERTEXT: usize = TSS_MAX_PLAINTEXT + AEAD_TAG_LEN;

// cshirt2 handshake (each direction):
// ```text
// | uniform_dh_pk | mac |
// |     192B      | 32B |
// ```
//
// cshirt2 record, `enc_len` and `enc_body` share one ChaCha20 keystream:
// ```text
// | mac | enc_len | enc_body                                |
// | 16B |   2B    | inner_len (2B) | inner    | padding     |
// ```
pub(crate) const UDH_KEY_LEN: usize = 192;
pub(crate) const CSHIRT2_HANDSHAKE_MAC_LEN: usize = 32;
pub(crate) const CSHIRT2_HANDSHAKE_LEN: usize = UDH_KEY_LEN + CSHIRT2_HANDSHAKE_MAC_LEN; // 224
pub(crate) const CSHIRT2_MAC_LEN: usize = 16;
pub(crate) const CSHIRT2_HDR_LEN: usize = CSHIRT2_MAC_LEN + 2; // 18
pub(crate) const CSHIRT2_INNER_LEN_FIELD: usize = 2;
pub(crate) const CSHIRT2_MAX_INNER: usize = 16 * 1024;

/// Writes up to this many bytes get random padding.
pub(crate) const CSHIRT2_PAD_THRESHOLD: usize = 3000;
pub(crate) const CSHIRT2_PAD_MAX: usize = 512;

/// Length of a cshirt2 epoch in seconds.
pub(crate) const CSHIRT2_EPOCH_SECS: u64 = 60;
