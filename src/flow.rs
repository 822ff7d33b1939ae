// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Control flow between the change sources and the apply functions.
//!
//! The outbox drainer and the change reader both walk an ordered sequence and
//! hand each item to a caller-supplied apply function. The apply function
//! answers with a [`Flow`]:
//!
//! | Flow | Item consumed? | Keep going? | Overall |
//! |------|----------------|-------------|---------|
//! | `Continue` | yes | yes | - |
//! | `StopSuccess` | yes | no | success |
//! | `StopFailure` | no | no | failure |

use crate::error::ReplicationError;
use tracing::warn;

/// Verdict of an apply function for a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Item applied; move on to the next one.
    Continue,
    /// Item applied; stop here and report success.
    StopSuccess,
    /// Item not applied; stop here, leave it in place and report failure.
    StopFailure,
}

impl Flow {
    /// Whether the current item counts as applied.
    pub fn consumed(self) -> bool {
        !matches!(self, Flow::StopFailure)
    }

    /// Whether iteration should go on after this item.
    pub fn proceed(self) -> bool {
        matches!(self, Flow::Continue)
    }

    /// Map a writer result: `Ok` continues, `Err` is logged and stops.
    pub fn from_apply<T>(result: &std::result::Result<T, ReplicationError>) -> Self {
        match result {
            Ok(_) => Flow::Continue,
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "Apply failed, stopping batch");
                crate::metrics::record_error(e.kind());
                Flow::StopFailure
            }
        }
    }
}

/// What a writer actually did with a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Deleted,
    /// Target already held these values; nothing written.
    Unchanged,
    /// Delete of something that was not there.
    AlreadyAbsent,
    /// Left alone because a local change to the same row is still queued.
    Deferred,
}

impl ApplyOutcome {
    /// Whether the target store was modified.
    pub fn wrote(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted)
    }

    /// Label for metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Unchanged => "unchanged",
            Self::AlreadyAbsent => "already_absent",
            Self::Deferred => "deferred",
        }
    }
}
