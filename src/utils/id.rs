//! Random ids, MAC addresses, and deterministic filesystem UUIDs.

use rand::RngCore;
use uuid::Uuid;

/// Returns a random 16-character hex string (8 bytes of entropy). Used for
/// VM ids and network ids.
pub fn generate_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    hex::encode(b)
}

/// Generates a random locally-administered unicast MAC address: bit 1 of
/// the first byte set (locally administered), bit 0 clear (unicast).
pub fn generate_mac() -> String {
    let mut b = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut b);
    b[0] = (b[0] | 0x02) & 0xFE;
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}

/// Deterministic UUID v5 in the URL namespace. Identical input always
/// yields the same UUID, so identical layer bytes produce the same EROFS
/// filesystem UUID.
pub fn uuid_v5(name: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}
