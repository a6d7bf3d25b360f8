use crate::gas::GasError;
use bitflags::bitflags;

bitflags! {
    /// How a localized region may be accessed, and what localizing it does to
    /// the local cache and to the home of the underlying blocks.
    ///
    /// Exactly one of [`RO`], [`RWE`] or [`RWS`] must be set. [`OWN`] can be
    /// combined with any of them.
    ///
    /// [`RO`]: AccessFlags::RO
    /// [`RWE`]: AccessFlags::RWE
    /// [`RWS`]: AccessFlags::RWS
    /// [`OWN`]: AccessFlags::OWN
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct AccessFlags: u8 {
        /// Read only. A cached copy of the region is reused if present.
        const RO = 1;

        /// Read-write, exclusive. Writes stay local until committed.
        const RWE = 1 << 1;

        /// Read-write, shared. The cached copy is refreshed from home memory
        /// before it is handed out.
        const RWS = 1 << 2;

        /// Migrate the home of the covered blocks to the localizing worker.
        const OWN = 1 << 3;

        /// Alias of [`AccessFlags::RO`].
        const REUSE = Self::RO.bits();

        /// Alias of [`AccessFlags::RWS`].
        const UPDATE = Self::RWS.bits();
    }
}

impl AccessFlags {
    const MODES: AccessFlags = AccessFlags::RO.union(AccessFlags::RWE).union(AccessFlags::RWS);

    pub(crate) fn validate(self) -> Result<Self, GasError> {
        if (self & Self::MODES).bits().count_ones() == 1 {
            Ok(self)
        } else {
            Err(GasError::InvalidFlags(self))
        }
    }

    pub fn is_writable(&self) -> bool {
        self.intersects(AccessFlags::RWE | AccessFlags::RWS)
    }

    pub(crate) fn refreshes(&self) -> bool {
        self.contains(AccessFlags::RWS)
    }

    pub(crate) fn takes_ownership(&self) -> bool {
        self.contains(AccessFlags::OWN)
    }
}
