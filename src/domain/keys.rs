use super::{EventType, MemberId, PartitionId};

/// Layout of a consumer group within the coordination store
///
/// ```text
/// /consumers/<consumer>/members/<member>
/// /consumers/<consumer>/leader/<event type>
/// /consumers/<consumer>/election/<event type>/...
/// /consumers/<consumer>/assignments/<event type>/<partition>
/// /consumers/<consumer>/offsets/<event type>/<partition>
/// /consumers/<consumer>/failures/<event type>/<partition>/<member>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerKeys {
    root: String,
}

impl ConsumerKeys {
    /// Layout for the given consumer name
    pub fn new(consumer_name: &str) -> Self {
        Self {
            root: format!("/consumers/{}", consumer_name),
        }
    }

    /// Root of the consumer group
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Parent of all member registrations
    pub fn members(&self) -> String {
        format!("{}/members", self.root)
    }

    /// Registration of a single member
    pub fn member(&self, member: &MemberId) -> String {
        format!("{}/members/{}", self.root, member)
    }

    /// Informational mirror of the current leader
    pub fn leader(&self, event_type: &EventType) -> String {
        format!("{}/leader/{}", self.root, event_type)
    }

    /// Private nodes of the leader election
    pub fn election(&self, event_type: &EventType) -> String {
        format!("{}/election/{}", self.root, event_type)
    }

    /// Parent of all assignments of an event type
    pub fn assignments(&self, event_type: &EventType) -> String {
        format!("{}/assignments/{}", self.root, event_type)
    }

    /// Assignment of a single partition, holding the member id
    pub fn assignment(&self, event_type: &EventType, partition: &PartitionId) -> String {
        format!("{}/assignments/{}/{}", self.root, event_type, partition)
    }

    /// Parent of all offsets of an event type
    pub fn offsets(&self, event_type: &EventType) -> String {
        format!("{}/offsets/{}", self.root, event_type)
    }

    /// Committed cursor of a single partition
    pub fn offset(&self, event_type: &EventType, partition: &PartitionId) -> String {
        format!("{}/offsets/{}/{}", self.root, event_type, partition)
    }

    /// Parent of all failure markers of an event type
    pub fn failures(&self, event_type: &EventType) -> String {
        format!("{}/failures/{}", self.root, event_type)
    }

    /// Parent of the failure markers of a single partition
    pub fn partition_failures(&self, event_type: &EventType, partition: &PartitionId) -> String {
        format!("{}/failures/{}/{}", self.root, event_type, partition)
    }

    /// Marker recording that a member failed to process a partition
    pub fn failure(&self, event_type: &EventType, partition: &PartitionId, member: &MemberId) -> String {
        format!("{}/failures/{}/{}/{}", self.root, event_type, partition, member)
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lay_out_paths() {
        let keys = ConsumerKeys::new("c1");
        let orders = EventType::new("orders");
        let partition = PartitionId::new("0");

        assert_eq!(keys.member(&"m1".into()), "/consumers/c1/members/m1");
        assert_eq!(keys.leader(&orders), "/consumers/c1/leader/orders");
        assert_eq!(keys.election(&orders), "/consumers/c1/election/orders");
        assert_eq!(keys.assignment(&orders, &partition), "/consumers/c1/assignments/orders/0");
        assert_eq!(keys.offset(&orders, &partition), "/consumers/c1/offsets/orders/0");
        assert_eq!(
            keys.failure(&orders, &partition, &"m1".into()),
            "/consumers/c1/failures/orders/0/m1"
        );
    }
}
