//! ARMv8-A hypervisor core implementing stage-2 memory virtualization with sub-page software
//! MMIO trap-and-emulate, paired with a framed UART command/event protocol used by a host-side
//! driver to control the guest and stream MMIO traces.
//!
//! ## Overview
//!
//! The crate is built around three components:
//!
//! 1. [`memory::PageTables`] owns the stage-2 translation tables: a fixed root L2 array walked
//!    by hardware, on-demand L3 tables, and a synthetic software-only L4 level that describes
//!    individual 32-bit words. The L4 level is what makes word-granularity MMIO hooks possible
//!    without the hardware walker ever seeing them: every descriptor that reaches it is invalid
//!    to hardware, so the guest faults and control returns to the hypervisor.
//! 2. [`core::HvCore::handle_dabort`] services those faults. It resolves the faulting address
//!    through the guest's stage-1 tables, finds the software descriptor covering the IPA,
//!    decodes the trapped load/store ([`decode`]) and performs the access it describes: a
//!    redirected read/write, an in-hypervisor callback, or a round-trip to the host driver.
//!    Accesses can additionally be traced over the proxy, synchronously if requested.
//! 3. [`proxy::UartProxy`] implements the host link: a blocking request/reply loop over any one
//!    of several byte-stream devices, with fingerprint-based framing, checksums in both
//!    directions, exception-guarded guest-memory transfers and asynchronous event frames.
//!
//! Everything the core needs from its surroundings is consumed through capability traits:
//! [`cpu::Cpu`] for privileged register and address-translation plumbing,
//! [`memory::GuestMem`] for guest physical memory, [`proxy::IoDevPool`] for the I/O devices,
//! and [`proxy::ProxyRpc`] / [`exceptions::ExcProxy`] for the host-facing RPC layers. The
//! [`core::HvCore`] singleton ties the pieces together and is what boot code and exception
//! vectors interact with.
//!
//! ## Reading order
//!
//! For a better understanding of the implementation and the interactions between its
//! components, it is recommended to read the documentation in the following order.
//!
//! 1. Memory management
//!     1. [Stage-2 page tables](memory::PageTables)
//!     2. [Guest memory access](memory::GuestMem)
//! 2. [Instruction decoding](decode)
//! 3. [Exception guards and proxied hooks](exceptions)
//! 4. [The UART proxy](proxy::UartProxy)
//! 5. [The core](core::HvCore)
//! 6. [Configuration](config::Config)

pub mod config;
pub mod core;
pub mod cpu;
pub mod decode;
pub mod error;
pub mod exceptions;
pub mod memory;
pub mod proxy;
pub mod utils;
