//! The pure decision table behind the inspection state machine (§4.E),
//! expressed the way the teacher's
//! `controller/src/util/pod_action.rs::PodActionInfo::select_pod_action`
//! expresses its own: a struct of the inputs a decision needs, with one
//! method that turns them into an action with no side effects.

use usage_shared::model::{ImageStatus, MachineImage};

/// The action to take for an image at its current point in the state
/// machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageAction {
    /// Jump straight to `inspected`, no inspection pipeline needed.
    ShortCircuitInspected,
    /// Jump straight to `error`, no inspection pipeline possible.
    ShortCircuitError,
    /// Move to the given next state and enqueue the pipeline step for it.
    Advance(ImageStatus),
    /// Already in flight or terminal; nothing to do.
    NoAction,
}

/// Everything [`select_transition`] needs to decide an image's next move.
pub struct ImageActionInfo {
    pub status: ImageStatus,
    pub skips_inspection: bool,
    pub is_encrypted: bool,
}

impl ImageActionInfo {
    pub fn for_image(image: &MachineImage) -> Self {
        Self {
            status: image.status,
            skips_inspection: image.skips_inspection(),
            is_encrypted: image.is_encrypted,
        }
    }

    /// Decides what to do with an image at discovery or at a retry-sweep
    /// pass (§4.E):
    ///
    /// ```text
    ///  pending ─► preparing ─► inspecting ─► inspected
    ///     │           │            │
    ///     │           └────────────┴──► error
    ///     └──► inspected             (any step may short-circuit here)
    /// ```
    ///
    /// Short-circuits apply only from `pending` — an image already moved
    /// past discovery has already made this decision once, and a terminal
    /// status is never revisited (monotonicity, §7/§8.7).
    pub fn select_transition(&self) -> ImageAction {
        log::trace!(
            "select_transition status={:?} skips_inspection={} is_encrypted={}",
            self.status,
            self.skips_inspection,
            self.is_encrypted
        );
        match self.status {
            ImageStatus::Pending => {
                if self.skips_inspection {
                    ImageAction::ShortCircuitInspected
                } else if self.is_encrypted {
                    ImageAction::ShortCircuitError
                } else {
                    ImageAction::Advance(ImageStatus::Preparing)
                }
            }
            ImageStatus::Preparing => ImageAction::Advance(ImageStatus::Inspecting),
            ImageStatus::Inspecting | ImageStatus::Inspected | ImageStatus::Error
            | ImageStatus::Unavailable => ImageAction::NoAction,
        }
    }
}

/// Free-function form for table-driven tests, mirroring the teacher's own
/// `controller_tests` module shape (§10.5).
pub fn select_transition(info: &ImageActionInfo) -> ImageAction {
    info.select_transition()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Case {
        name: &'static str,
        status: ImageStatus,
        skips_inspection: bool,
        is_encrypted: bool,
        expect: ImageAction,
    }

    #[test]
    fn transition_table_matches_the_state_diagram() {
        let cases = [
            Case {
                name: "pending marketplace short-circuits",
                status: ImageStatus::Pending,
                skips_inspection: true,
                is_encrypted: false,
                expect: ImageAction::ShortCircuitInspected,
            },
            Case {
                name: "pending encrypted short-circuits to error",
                status: ImageStatus::Pending,
                skips_inspection: false,
                is_encrypted: true,
                expect: ImageAction::ShortCircuitError,
            },
            Case {
                name: "pending ordinary image advances to preparing",
                status: ImageStatus::Pending,
                skips_inspection: false,
                is_encrypted: false,
                expect: ImageAction::Advance(ImageStatus::Preparing),
            },
            Case {
                name: "preparing advances to inspecting",
                status: ImageStatus::Preparing,
                skips_inspection: false,
                is_encrypted: false,
                expect: ImageAction::Advance(ImageStatus::Inspecting),
            },
            Case {
                name: "inspecting takes no further action here",
                status: ImageStatus::Inspecting,
                skips_inspection: false,
                is_encrypted: false,
                expect: ImageAction::NoAction,
            },
            Case {
                name: "inspected is terminal",
                status: ImageStatus::Inspected,
                skips_inspection: false,
                is_encrypted: false,
                expect: ImageAction::NoAction,
            },
            Case {
                name: "error is terminal",
                status: ImageStatus::Error,
                skips_inspection: false,
                is_encrypted: false,
                expect: ImageAction::NoAction,
            },
        ];
        for case in cases {
            let info = ImageActionInfo {
                status: case.status,
                skips_inspection: case.skips_inspection,
                is_encrypted: case.is_encrypted,
            };
            assert_eq!(select_transition(&info), case.expect, "case: {}", case.name);
        }
    }
}
