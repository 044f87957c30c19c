use std::fmt;

/// Fatal conditions that abort the current method's compilation. The
/// driving compiler is expected to drop the per-method context and, for
/// tier-related failures, retry with a lower optimization tier.
///
/// Programming-contract violations (a register marked both GC-ref and
/// byref, appending after finalization, opening an already-open scope
/// range) are asserts, not errors: they indicate an upstream bug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// The prolog filled its fixed instruction-descriptor budget. The
    /// prolog group is the one group that never auto-extends.
    PrologBufferOverflow { capacity: usize },

    /// A branch distance that no published encoding form of the target
    /// architecture can reach.
    BranchOutOfRange { distance: i64 },
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FatalError::PrologBufferOverflow { capacity } => write!(
                f,
                "prolog instruction buffer overflow (capacity {} descriptors); \
                 recompile with reduced optimization",
                capacity
            ),
            FatalError::BranchOutOfRange { distance } => {
                write!(f, "branch distance {} exceeds all encoding forms", distance)
            }
        }
    }
}

impl std::error::Error for FatalError {}

pub type EmitResult<T> = Result<T, FatalError>;
