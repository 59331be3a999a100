//! Shared types for tuner device management.

use bytes::Bytes;

/// TS packet size.
pub const TS_PACKET_SIZE: usize = 188;
/// TS sync byte.
pub const SYNC_BYTE: u8 = 0x47;
/// Highest valid PID (13-bit field).
pub const MAX_PID: u16 = 0x1FFF;

/// Stable identifier for one physical tuner slot.
///
/// Assigned by the hot-plug resolver and fixed for the process lifetime;
/// a slot keeps its id across unplug/replug cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "adapter{}", self.0)
    }
}

/// Role of one hot-pluggable hardware resource within a tuner slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRole {
    /// Conditional access module (optional).
    ConditionalAccess,
    /// PID demultiplexer.
    Demux,
    /// Raw transport-stream source ("DVR").
    StreamSource,
    /// Demodulator frontend (lock/signal/SNR).
    Frontend,
}

impl ResourceRole {
    const ALL: [ResourceRole; 4] = [
        ResourceRole::ConditionalAccess,
        ResourceRole::Demux,
        ResourceRole::StreamSource,
        ResourceRole::Frontend,
    ];

    fn bit(self) -> u8 {
        match self {
            ResourceRole::ConditionalAccess => 1 << 0,
            ResourceRole::Demux => 1 << 1,
            ResourceRole::StreamSource => 1 << 2,
            ResourceRole::Frontend => 1 << 3,
        }
    }

    /// Whether a device is unusable without this resource.
    pub fn is_mandatory(self) -> bool {
        !matches!(self, ResourceRole::ConditionalAccess)
    }
}

/// Set of currently-attached resource roles for one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceSet(u8);

impl PresenceSet {
    const MANDATORY: u8 = (1 << 1) | (1 << 2) | (1 << 3);

    pub fn insert(&mut self, role: ResourceRole) {
        self.0 |= role.bit();
    }

    pub fn remove(&mut self, role: ResourceRole) {
        self.0 &= !role.bit();
    }

    pub fn contains(self, role: ResourceRole) -> bool {
        self.0 & role.bit() != 0
    }

    /// True when demux, stream source and frontend are all attached.
    pub fn is_mandatory_complete(self) -> bool {
        self.0 & Self::MANDATORY == Self::MANDATORY
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = ResourceRole> {
        ResourceRole::ALL.into_iter().filter(move |r| self.contains(*r))
    }
}

/// Broadcast standard handled by a frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransmissionType {
    Cable,
    Satellite,
    Terrestrial,
    Atsc,
}

impl TransmissionType {
    const ALL: [TransmissionType; 4] = [
        TransmissionType::Cable,
        TransmissionType::Satellite,
        TransmissionType::Terrestrial,
        TransmissionType::Atsc,
    ];

    fn bit(self) -> u8 {
        match self {
            TransmissionType::Cable => 1 << 0,
            TransmissionType::Satellite => 1 << 1,
            TransmissionType::Terrestrial => 1 << 2,
            TransmissionType::Atsc => 1 << 3,
        }
    }
}

/// Set of standards a frontend supports, fixed at identification time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmissionTypes(u8);

impl TransmissionTypes {
    pub fn insert(&mut self, ty: TransmissionType) {
        self.0 |= ty.bit();
    }

    pub fn contains(self, ty: TransmissionType) -> bool {
        self.0 & ty.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = TransmissionType> {
        TransmissionType::ALL
            .into_iter()
            .filter(move |t| self.contains(*t))
    }
}

impl FromIterator<TransmissionType> for TransmissionTypes {
    fn from_iter<I: IntoIterator<Item = TransmissionType>>(iter: I) -> Self {
        let mut types = TransmissionTypes::default();
        for ty in iter {
            types.insert(ty);
        }
        types
    }
}

/// Readiness/tuning state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Mandatory resources missing or identification failed.
    NotReady,
    /// Identified and ready to tune.
    Idle,
    /// Waiting for the dish rotor to settle.
    RotorMoving,
    /// Tune command sent, polling for hardware lock.
    Tuning,
    /// Hardware lock acquired.
    Tuned,
}

/// One physical channel's frequency/modulation parameters.
///
/// Produced by configuration management; the core forwards the raw
/// payload to the frontend untouched and reads only the standard tag.
#[derive(Debug, Clone)]
pub struct Transponder {
    pub transmission_type: TransmissionType,
    /// Per-standard encoded parameters, opaque to the core.
    pub raw: Bytes,
}

/// Device-side tuning configuration for one tune request.
#[derive(Debug, Clone, Default)]
pub struct TuningConfig {
    /// Whether reaching this transponder needs a physical dish move.
    pub needs_rotor: bool,
    /// Per-standard encoded configuration, opaque to the core.
    pub raw: Bytes,
}

/// Extract the 13-bit PID from a TS packet header.
///
/// Returns `None` when the sync byte is wrong; such frames must not be
/// dispatched.
pub fn packet_pid(packet: &[u8; TS_PACKET_SIZE]) -> Option<u16> {
    if packet[0] != SYNC_BYTE {
        return None;
    }
    Some(((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mandatory_complete() {
        let mut set = PresenceSet::default();
        assert!(set.is_empty());
        assert!(!set.is_mandatory_complete());

        set.insert(ResourceRole::Demux);
        set.insert(ResourceRole::StreamSource);
        assert!(!set.is_mandatory_complete());

        set.insert(ResourceRole::Frontend);
        assert!(set.is_mandatory_complete());

        // CA is optional and does not affect completeness
        set.remove(ResourceRole::ConditionalAccess);
        assert!(set.is_mandatory_complete());

        set.remove(ResourceRole::StreamSource);
        assert!(!set.is_mandatory_complete());
        assert!(!set.is_empty());
    }

    #[test]
    fn test_transmission_type_set() {
        let types: TransmissionTypes =
            [TransmissionType::Satellite, TransmissionType::Terrestrial]
                .into_iter()
                .collect();
        assert!(types.contains(TransmissionType::Satellite));
        assert!(!types.contains(TransmissionType::Cable));
        assert_eq!(types.iter().count(), 2);
    }

    #[test]
    fn test_packet_pid() {
        let mut packet = [0u8; TS_PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        packet[1] = 0x1F;
        packet[2] = 0xFF;
        assert_eq!(packet_pid(&packet), Some(MAX_PID));

        packet[1] = 0x40; // transport error bit set, pid zero
        packet[2] = 0x00;
        assert_eq!(packet_pid(&packet), Some(0));

        packet[0] = 0x00;
        assert_eq!(packet_pid(&packet), None);
    }
}
