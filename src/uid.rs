//! DICOM unique identifiers derived from random UUIDs (ISO/IEC 9834-8).

use std::collections::HashSet;

use uuid::Uuid;

/// Root under which UUID-derived UIDs live.
pub const UUID_UID_ROOT: &str = "2.25";

/// Longest UID the UI value representation allows.
pub const MAX_UID_LENGTH: usize = 64;

/// A fresh `2.25.<decimal UUIDv4>` identifier.
pub fn generate_uid() -> String {
    format!("{UUID_UID_ROOT}.{}", Uuid::new_v4().as_u128())
}

/// Whether `uid` is made of dot-separated decimal components without leading
/// zeros and fits the UI length limit.
pub fn is_valid_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= MAX_UID_LENGTH
        && uid.split('.').all(|component| {
            !component.is_empty()
                && component.bytes().all(|b| b.is_ascii_digit())
                && (component == "0" || !component.starts_with('0'))
        })
}

/// Hands out UIDs that are distinct from every UID issued before by the same
/// generator.
#[derive(Debug, Default)]
pub struct UidGenerator {
    issued: HashSet<String>,
}

impl UidGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_uid(&mut self) -> String {
        loop {
            let uid = generate_uid();
            if self.issued.insert(uid.clone()) {
                return uid;
            }
            log::warn!("Regenerating colliding UID {uid}");
        }
    }

    /// Number of UIDs handed out so far.
    pub fn issued(&self) -> usize {
        self.issued.len()
    }
}
