use super::InsnId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("branch {branch:?} targets {target:?}, which is not part of the body")]
    DanglingTarget { branch: InsnId, target: InsnId },

    #[error("branch {0:?} was never given a target")]
    PendingBranch(InsnId),

    #[error("exception region #{region} has a boundary that does not resolve")]
    UnresolvedRegion { region: usize },

    #[error("exception regions #{first} and #{second} partially overlap")]
    OverlappingRegions { first: usize, second: usize },

    /// Inner regions must come first
    #[error("exception region #{inner} is nested in #{outer} but listed after it")]
    MisorderedRegions { outer: usize, inner: usize },

    /// Short branches must be widened before encoding
    #[error("short branch {branch:?} is {distance} bytes away from its target")]
    ShortBranchOutOfRange { branch: InsnId, distance: isize },

    #[error("instruction {at:?} has an operand that does not fit `{mnemonic}`")]
    BadOperand { at: InsnId, mnemonic: &'static str },

    /// Removing an instruction that starts a region with nothing after it to take its place
    #[error("instruction {0:?} anchors an exception region and cannot be removed")]
    AnchorsRegion(InsnId),

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
