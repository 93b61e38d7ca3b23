//! Contains all error types that can be returned by this crate.

use std::alloc;
use std::error;
use std::fmt;

/// Convenient `Result` type for custom errors.
pub type Result<T> = std::result::Result<T, Error>;

// -----------------------------------------------------------------------------------------------
// Errors - General
// -----------------------------------------------------------------------------------------------

/// Main error structure which is just a simple wrapper for all errors that can be returned by the
/// hypervisor core.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// Instruction-emulation errors.
    Emulation(EmulationError),
    /// Exception-handling errors.
    Exception(ExceptionError),
    /// Memory-related errors.
    Memory(MemoryError),
    /// Proxy-related errors.
    Proxy(ProxyError),
    /// Generic user-defined errors.
    Generic(String),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Emulation(e) => write!(f, "[Emulation error] {}", e),
            Error::Exception(e) => write!(f, "[Exception error] {}", e),
            Error::Memory(e) => write!(f, "[Memory error] {}", e),
            Error::Proxy(e) => write!(f, "[Proxy error] {}", e),
            Error::Generic(e) => write!(f, "[Error] {}", e),
        }
    }
}

impl From<EmulationError> for Error {
    fn from(error: EmulationError) -> Self {
        Error::Emulation(error)
    }
}

impl From<ExceptionError> for Error {
    fn from(error: ExceptionError) -> Self {
        Error::Exception(error)
    }
}

impl From<MemoryError> for Error {
    fn from(error: MemoryError) -> Self {
        Error::Memory(error)
    }
}

impl From<ProxyError> for Error {
    fn from(error: ProxyError) -> Self {
        Error::Proxy(error)
    }
}

impl From<alloc::LayoutError> for Error {
    fn from(error: alloc::LayoutError) -> Self {
        Error::Memory(MemoryError::LayoutError(error))
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Emulation
// -----------------------------------------------------------------------------------------------

/// Instruction-emulation errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EmulationError {
    /// The load instruction encoding is not emulated.
    UnhandledLoad(u32),
    /// The store instruction encoding is not emulated.
    UnhandledStore(u32),
    /// User-defined emulation error.
    Generic(String),
}

impl error::Error for EmulationError {}

impl fmt::Display for EmulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmulationError::UnhandledLoad(i) => write!(f, "load not emulated: {:#010x}", i),
            EmulationError::UnhandledStore(i) => write!(f, "store not emulated: {:#010x}", i),
            EmulationError::Generic(e) => write!(f, "{}", e),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Exception
// -----------------------------------------------------------------------------------------------

/// Exception-handling errors. All of these leave the guest PC untouched so the caller can
/// escalate with the full fault context intact.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExceptionError {
    /// Stage-1 translation of the faulting virtual address failed.
    Stage1TranslationFault(u64),
    /// The translated IPA does not fit in the guest physical address space.
    IpaOutOfBounds(u64),
    /// No stage-2 mapping describes the faulting IPA.
    UnmappedIpa(u64),
    /// A data abort occurred on a hardware-mapped page, which should never trap.
    AbortOnHwMapping(u64),
    /// The faulting instruction could not be fetched.
    InstructionFetchFault(u64),
    /// The software PTE kind is not dispatchable.
    InvalidSpte(u64, u64),
    /// No callback is registered for the hook token found in the PTE.
    UnknownHook(u64),
    /// User-defined exception error.
    Generic(String),
}

impl error::Error for ExceptionError {}

impl fmt::Display for ExceptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionError::Stage1TranslationFault(a) => {
                write!(f, "stage 1 translation failed at VA {:#x}", a)
            }
            ExceptionError::IpaOutOfBounds(a) => write!(f, "IPA out of bounds: {:#x}", a),
            ExceptionError::UnmappedIpa(a) => write!(f, "unmapped IPA {:#x}", a),
            ExceptionError::AbortOnHwMapping(a) => {
                write!(f, "data abort on hardware-mapped page ({:#x})", a)
            }
            ExceptionError::InstructionFetchFault(a) => {
                write!(f, "could not fetch instruction for data abort at {:#x}", a)
            }
            ExceptionError::InvalidSpte(pte, ipa) => {
                write!(f, "invalid SPTE {:#018x} for IPA {:#x}", pte, ipa)
            }
            ExceptionError::UnknownHook(t) => write!(f, "unknown hook token {:#x}", t),
            ExceptionError::Generic(e) => write!(f, "{}", e),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Memory
// -----------------------------------------------------------------------------------------------

/// Memory-related errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MemoryError {
    /// A bus or page fault occurred while accessing the address.
    BusFault(u64),
    /// Hardware mappings must cover whole 16 KiB granules.
    SubPageHwMapping(u64),
    /// Wrapper for `alloc::LayoutError`.
    LayoutError(alloc::LayoutError),
    /// The allocator is out of memory.
    OutOfMemory,
    /// The address is not aligned as expected.
    UnalignedAddress(u64),
    /// The size is not aligned as expected.
    UnalignedSize(u64),
    /// User-defined memory error.
    Generic(String),
}

impl error::Error for MemoryError {}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::BusFault(a) => write!(f, "bus fault at address {:#x}", a),
            MemoryError::SubPageHwMapping(a) => {
                write!(f, "cannot use sub-page granules with HW mappings ({:#x})", a)
            }
            MemoryError::LayoutError(e) => write!(f, "layout error: {}", e),
            MemoryError::OutOfMemory => write!(f, "the allocator ran out of memory"),
            MemoryError::UnalignedAddress(a) => write!(f, "unaligned address: ({:#x})", a),
            MemoryError::UnalignedSize(s) => write!(f, "unaligned size: ({:#x})", s),
            MemoryError::Generic(e) => write!(f, "{}", e),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Proxy
// -----------------------------------------------------------------------------------------------

/// Proxy-related errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProxyError {
    /// A blocking read on the bound I/O device failed.
    IoDevRead(usize),
    /// The device id is outside the configured pool.
    InvalidIoDev(usize),
    /// The event payload does not fit in a 16-bit length field.
    EventTooLarge(usize),
    /// User-defined proxy error.
    Generic(String),
}

impl error::Error for ProxyError {}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::IoDevRead(d) => write!(f, "iodev {} read failed", d),
            ProxyError::InvalidIoDev(d) => write!(f, "invalid iodev {}", d),
            ProxyError::EventTooLarge(l) => write!(f, "event payload too large ({} bytes)", l),
            ProxyError::Generic(e) => write!(f, "{}", e),
        }
    }
}
