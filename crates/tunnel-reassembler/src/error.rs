//! Error taxonomy for the Fragment Reassembler (spec §7).

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("fragment index out of range")]
    IndexOutOfRange,
    #[error("fragment size does not match declared fragment_size")]
    FragmentSizeMismatch,
    #[error("fragment disagrees with the group it claims to belong to")]
    GroupMismatch,
    #[error("group original_size exceeds the reassembler's size cap")]
    GroupSizeTooLarge,
    #[error("group cap reached even after an expiry sweep")]
    TooManyGroups,
    #[error("reassembled bytes do not match the group's original_size")]
    ReassembledSizeMismatch,
}

pub type Result<T> = std::result::Result<T, Error>;
