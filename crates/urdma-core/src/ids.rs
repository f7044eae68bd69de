//! Device and queue-pair identifiers

use core::fmt;

/// Dataplane port (device) index
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DevId(u16);

impl DevId {
    #[inline]
    pub const fn new(id: u16) -> Self {
        DevId(id)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Get as usize for indexing
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Per-port queue pair index
///
/// Index 0 is the port's control queue and is never handed to a process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct QpId(u16);

impl QpId {
    /// The per-port control queue
    pub const CONTROL: QpId = QpId(0);

    #[inline]
    pub const fn new(id: u16) -> Self {
        QpId(id)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// True for the reserved control queue
    #[inline]
    pub const fn is_control(self) -> bool {
        self.0 == 0
    }
}

impl From<u16> for DevId {
    #[inline]
    fn from(id: u16) -> Self {
        DevId(id)
    }
}

impl From<u16> for QpId {
    #[inline]
    fn from(id: u16) -> Self {
        QpId(id)
    }
}

impl fmt::Debug for DevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevId({})", self.0)
    }
}

impl fmt::Display for DevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for QpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QpId({})", self.0)
    }
}

impl fmt::Display for QpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qp_id_control() {
        assert!(QpId::CONTROL.is_control());
        assert!(!QpId::new(1).is_control());
    }

    #[test]
    fn test_id_conversions() {
        let dev: DevId = 3u16.into();
        assert_eq!(dev.as_u16(), 3);
        assert_eq!(dev.as_usize(), 3);

        let qp: QpId = 17u16.into();
        assert_eq!(qp.as_usize(), 17);
        assert_eq!(format!("{:?}", qp), "QpId(17)");
        assert_eq!(qp.to_string(), "17");
    }
}
