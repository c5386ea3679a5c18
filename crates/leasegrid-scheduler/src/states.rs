//! Instance lifecycle state constants.
//!
//! States are small non-negative integers forming the normal run, plus
//! three kinds of special markers: `SCHEDULED_ONLY` (between the schedule
//! call and create finalization), the two destroy sentinels outside the
//! numeric run, and the `CORRUPTED` offset — `CORRUPTED + X` means "an
//! error occurred while trying to reach X".

/// Between the schedule call and create finalization.
pub const STATE_SCHEDULED_ONLY: i32 = -1;
/// Terminal sentinel: destruction completed.
pub const STATE_DESTROY_SUCCEEDED: i32 = -3;
/// Terminal sentinel: destruction failed.
pub const STATE_DESTROY_FAILED: i32 = -4;

pub const STATE_UNPROPAGATED: i32 = 0;
pub const STATE_PROPAGATED: i32 = 1;
pub const STATE_STARTING: i32 = 2;
pub const STATE_STARTED: i32 = 3;
pub const STATE_PAUSED: i32 = 4;
pub const STATE_READYING_FOR_TRANSPORT: i32 = 5;
pub const STATE_READY_FOR_TRANSPORT: i32 = 6;
pub const STATE_CANCELLING: i32 = 7;
pub const STATE_DESTROYING: i32 = 8;

/// First notification after successful scheduling: the service layer has
/// finished finalizing creation and policy modules may act.
pub const STATE_FIRST_LEGAL: i32 = STATE_UNPROPAGATED;

/// Offset marking "failed while trying to reach" a state.
pub const STATE_CORRUPTED: i32 = 100;

/// Upper bound of the legal envelope.
pub const STATE_LAST_LEGAL: i32 = STATE_CORRUPTED + STATE_DESTROYING;

/// Accepts the legal envelope `[FIRST_LEGAL, LAST_LEGAL]` plus the two
/// destroy sentinels. `SCHEDULED_ONLY` is an internal marker, never a
/// notification payload, and is rejected here.
pub fn is_valid_state(state: i32) -> bool {
    if state == STATE_DESTROY_SUCCEEDED || state == STATE_DESTROY_FAILED {
        return true;
    }
    if state > STATE_DESTROYING && state < STATE_CORRUPTED {
        return false;
    }
    (STATE_FIRST_LEGAL..=STATE_LAST_LEGAL).contains(&state)
}

/// Render a state for logs, including `corrupted-*` forms.
pub fn state_name(state: i32) -> String {
    let base = |s: i32| -> &'static str {
        match s {
            STATE_UNPROPAGATED => "unpropagated",
            STATE_PROPAGATED => "propagated",
            STATE_STARTING => "starting",
            STATE_STARTED => "started",
            STATE_PAUSED => "paused",
            STATE_READYING_FOR_TRANSPORT => "readying-for-transport",
            STATE_READY_FOR_TRANSPORT => "ready-for-transport",
            STATE_CANCELLING => "cancelling",
            STATE_DESTROYING => "destroying",
            _ => "unknown",
        }
    };
    match state {
        STATE_SCHEDULED_ONLY => "scheduled-only".to_string(),
        STATE_DESTROY_SUCCEEDED => "destroy-succeeded".to_string(),
        STATE_DESTROY_FAILED => "destroy-failed".to_string(),
        s if (STATE_CORRUPTED..=STATE_LAST_LEGAL).contains(&s) => {
            format!("corrupted-{}", base(s - STATE_CORRUPTED))
        }
        s => base(s).to_string(),
    }
}
