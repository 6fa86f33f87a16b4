pub const TMP_FILE_EXT: &str = ".tmp";

pub const TARGET_STATES_FILE_NAME: &str = "targetstates";
pub const NEEDS_RESYNC_FILE_NAME: &str = "targets_need_resync";
pub const BUDDY_GROUPS_FILE_NAME: &str = "mirrorbuddygroups.json";
pub const TARGET_MAPPINGS_FILE_NAME: &str = "targetmappings.json";

/// Outstanding references to a single node beyond this count are reported as a probable leak.
pub const REFCOUNT_WARN_THRESHOLD: usize = 2000;

/// Buddy group IDs are 16 bits wide; 0 is reserved for "unmapped".
pub const MAX_BUDDY_GROUP_ID: u16 = u16::MAX - 1;
