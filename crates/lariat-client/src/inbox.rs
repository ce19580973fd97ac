// Unique reply subjects for request/reply.
use std::fmt::Write;

use rand::Rng;

pub const INBOX_PREFIX: &str = "_INBOX.";

/// Generate a fresh inbox subject: the prefix plus a random 13-byte
/// hex suffix. Unique for all practical purposes, and subscribable
/// like any other subject.
pub fn new_inbox() -> String {
    let mut suffix = [0u8; 13];
    rand::rng().fill(&mut suffix[..]);
    let mut inbox = String::with_capacity(INBOX_PREFIX.len() + suffix.len() * 2);
    inbox.push_str(INBOX_PREFIX);
    for byte in suffix {
        // Writing hex into a String cannot fail.
        let _ = write!(inbox, "{byte:02x}");
    }
    inbox
}
