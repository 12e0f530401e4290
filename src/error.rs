use swap::SwapFileError;

#[derive(Debug, PartialEq)]
pub enum VmError {
    /// Virtual address outside the process's page table. A hard fault:
    /// surfaced to the syscall layer, never resolved by paging.
    AddressOutOfRange { vpn: u32 },
    /// Write against a page backed by a read-only image section.
    WriteToReadOnly { vpn: u32 },
    /// Not enough free frames to build an eagerly mapped address space.
    OutOfMemory,
    /// Swap media failure (truncated read or write). Fatal to the
    /// operation; the design assumes the swap file never fails.
    SwapIo(SwapFileError),
}

impl From<SwapFileError> for VmError {
    fn from(err: SwapFileError) -> Self {
        VmError::SwapIo(err)
    }
}
