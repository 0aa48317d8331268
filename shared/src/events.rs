/// Relation lifecycle notifications delivered by the orchestration layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationEvent {
    Joined { relation_id: u64 },
    Changed { relation_id: u64 },
    Departed { relation_id: u64, unit: String },
}

impl RelationEvent {
    pub fn relation_id(&self) -> u64 {
        match self {
            RelationEvent::Joined { relation_id }
            | RelationEvent::Changed { relation_id }
            | RelationEvent::Departed { relation_id, .. } => *relation_id,
        }
    }
}

/// Notifications raised towards the orchestration layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// A connection exists and registrations can be sent
    RelationReady { relation_id: u64 },

    /// The provider's aggregated view of requests changed
    RequestsChanged { hash: String },

    /// A new provider response is available to the requester
    ResponseAvailable { hash: String },
}
