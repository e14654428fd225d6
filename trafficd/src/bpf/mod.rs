// BPF plumbing: typed maps, pinning, program loading and attachment

pub mod attach;
pub mod loader;
pub mod map;
pub mod pin;
pub mod support;

pub use attach::{Hook, HookState, ProgramAttacher};
pub use loader::{ProgramError, ProgramObject};
pub use map::{MapError, MapKeys, TypedMap, UpdatePolicy};
pub use pin::{MapRegistry, PinnedMap};
pub use support::BpfMode;
