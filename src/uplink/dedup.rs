use serde::{Deserialize, Serialize};

use crate::model::Ms;

/// Last accepted frame of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameCursor {
    /// Bumped each time the frame counter restarts (device reset or 32-bit wrap).
    pub epoch: u32,
    pub last_fcnt: u32,
    pub seen_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCheck {
    Fresh { epoch: u32 },
    /// Counter jumped back far enough to be a restart, not a replay.
    Rollover { epoch: u32 },
    Duplicate,
}

/// Classify `fcnt` against the device's cursor.
pub fn check_frame(cursor: Option<&FrameCursor>, fcnt: u32, rollover_gap: u32) -> FrameCheck {
    let Some(cursor) = cursor else {
        return FrameCheck::Fresh { epoch: 0 };
    };
    if fcnt > cursor.last_fcnt {
        return FrameCheck::Fresh {
            epoch: cursor.epoch,
        };
    }
    if cursor.last_fcnt - fcnt >= rollover_gap.max(1) {
        FrameCheck::Rollover {
            epoch: cursor.epoch.wrapping_add(1),
        }
    } else {
        FrameCheck::Duplicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GAP: u32 = 16_384;

    fn cursor(last_fcnt: u32) -> FrameCursor {
        FrameCursor {
            epoch: 3,
            last_fcnt,
            seen_at: 0,
        }
    }

    #[test]
    fn first_frame_starts_epoch_zero() {
        assert_eq!(check_frame(None, 77, GAP), FrameCheck::Fresh { epoch: 0 });
    }

    #[test]
    fn forward_counter_is_fresh() {
        assert_eq!(check_frame(Some(&cursor(10)), 11, GAP), FrameCheck::Fresh { epoch: 3 });
    }

    #[test]
    fn repeat_and_small_step_back_are_duplicates() {
        assert_eq!(check_frame(Some(&cursor(10)), 10, GAP), FrameCheck::Duplicate);
        assert_eq!(check_frame(Some(&cursor(500)), 120, GAP), FrameCheck::Duplicate);
    }

    #[test]
    fn wrap_or_reset_opens_new_epoch() {
        assert_eq!(
            check_frame(Some(&cursor(u32::MAX - 2)), 1, GAP),
            FrameCheck::Rollover { epoch: 4 }
        );
        assert_eq!(
            check_frame(Some(&cursor(GAP)), 0, GAP),
            FrameCheck::Rollover { epoch: 4 }
        );
    }
}
