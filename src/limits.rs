/// Longest accepted member/trainer id.
pub const MAX_PARTY_ID_LEN: usize = 128;

/// Longest free-text field (notes, cancel reason).
pub const MAX_NOTES_LEN: usize = 4096;

pub const MAX_FOCUS_AREA_LEN: usize = 256;

/// A single session may not run longer than this.
pub const MAX_SESSION_HOURS: i64 = 24;

pub const MAX_PARTICIPANTS_PER_SESSION: usize = 500;

pub const MAX_SESSIONS: usize = 1_000_000;

/// Largest encoded snapshot the WAL writes or trusts on replay.
pub const MAX_WAL_ENTRY_BYTES: usize = 4 * 1024 * 1024;
