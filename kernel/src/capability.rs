// kernel/src/capability.rs
//
// Thread capability (permission) masks.  A child thread can never hold a
// capability its parent lacks; the masks are ANDed at thread creation.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: usize {
        const CONTRACT_ADDRESS_SPACE    = 0x0001;
        const CREATE_ADDRESS_SPACE      = 0x0002;
        const DELETE_ADDRESS_SPACE      = 0x0004;
        const EXPAND_ADDRESS_SPACE      = 0x0008;

        const CREATE_THREAD             = 0x0010;
        const DELETE_THREAD             = 0x0020;

        const MAP_DEVICE                = 0x0040;
        const UNMAP_DEVICE              = 0x0080;

        const EXPLICIT_TARGET_ADDRESS   = 0x1000;
    }
}

impl Capabilities {
    /// Every capability; kernel threads run with this mask.
    pub const ALL: Capabilities = Capabilities::all();

    /// Mask for user-mode driver threads.
    pub const DRIVER: Capabilities =
        Capabilities::MAP_DEVICE.union(Capabilities::UNMAP_DEVICE);

    /// Plain user threads start with no capabilities.
    pub const NONE: Capabilities = Capabilities::empty();
}
