use std::{
    cmp::{min, Ordering},
    collections::{hash_map::Entry, BTreeMap, HashMap, HashSet},
    fmt,
};

use bytes::Bytes;
use tracing::debug;

use crate::{
    error::Result, metadata::TopicPartition, Error, MemberId, PartitionId, DEFAULT_GENERATION_ID,
};

/// member id -> topic -> partitions
pub type AssignmentPlan = HashMap<MemberId, HashMap<String, Vec<PartitionId>>>;

/// A strategy the group leader runs to divide the partitions of the subscribed topics
/// among the members of a generation.
///
/// `plan` and `assignment_data` are only ever called from the task holding the group
/// coordinator, so implementations may keep state across generations without locking.
pub trait PartitionAssigner: Send + Sync {
    fn name(&self) -> &str;

    /// Every member present in `members` must get an entry, possibly empty, and every
    /// partition of a subscribed topic must be owned by exactly one subscribed member.
    fn plan(
        &mut self,
        members: &HashMap<MemberId, Subscription>,
        topics: &HashMap<String, Vec<PartitionId>>,
    ) -> Result<AssignmentPlan>;

    /// Opaque payload handed to `member_id` with its assignment. The member sends it back
    /// as user data when it joins the next generation. May run several times for the same
    /// generation and must return the same payload each time.
    fn assignment_data(
        &mut self,
        _member_id: &str,
        _topics: &HashMap<String, Vec<PartitionId>>,
        _generation_id: i32,
    ) -> Result<Option<Bytes>> {
        Ok(None)
    }
}

/// Member metadata sent with every join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topics: HashSet<String>,
    pub user_data: Option<Bytes>,
    /// partitions claimed in the generation the member comes from
    pub owned_partitions: HashMap<String, Vec<PartitionId>>,
    pub generation_id: i32,
    pub group_instance_id: Option<String>,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            topics: HashSet::new(),
            user_data: None,
            owned_partitions: HashMap::new(),
            generation_id: DEFAULT_GENERATION_ID,
            group_instance_id: None,
        }
    }
}

impl Subscription {
    pub fn new(
        topics: HashSet<String>,
        user_data: Option<Bytes>,
        owned_partitions: HashMap<String, Vec<PartitionId>>,
    ) -> Self {
        Self {
            topics,
            user_data,
            owned_partitions,
            ..Default::default()
        }
    }

    pub fn generation_id(&mut self, generation_id: i32) {
        self.generation_id = generation_id;
    }

    pub fn group_instance_id(&mut self, group_instance_id: Option<String>) {
        self.group_instance_id = group_instance_id;
    }
}

/// The slice of a plan one member receives on sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    pub partitions: HashMap<String, Vec<PartitionId>>,
    pub user_data: Option<Bytes>,
}

impl Assignment {
    pub fn new(partitions: HashMap<String, Vec<PartitionId>>) -> Self {
        Self {
            partitions,
            user_data: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(Vec::is_empty)
    }
}

#[derive(Debug, Clone)]
struct MemberInfo<'a> {
    member_id: &'a MemberId,
    group_instance_id: Option<&'a String>,
}

impl<'a> MemberInfo<'a> {
    fn sort(member_a: &MemberInfo, member_b: &MemberInfo) -> Ordering {
        match (member_a.group_instance_id, member_b.group_instance_id) {
            (Some(a), Some(b)) => a.cmp(b).then_with(|| member_a.member_id.cmp(member_b.member_id)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => member_a.member_id.cmp(member_b.member_id),
        }
    }
}

fn sorted_members(members: &HashMap<MemberId, Subscription>) -> Vec<MemberInfo<'_>> {
    let mut infos: Vec<MemberInfo> = members
        .iter()
        .map(|(member_id, subscription)| MemberInfo {
            member_id,
            group_instance_id: subscription.group_instance_id.as_ref(),
        })
        .collect();
    infos.sort_by(MemberInfo::sort);
    infos
}

/// An entry for every member holding every topic it subscribes to.
fn empty_plan(members: &HashMap<MemberId, Subscription>) -> AssignmentPlan {
    let mut plan = HashMap::with_capacity(members.len());
    for (member_id, subscription) in members {
        let mut partitions = HashMap::with_capacity(subscription.topics.len());
        for topic in subscription.topics.iter() {
            partitions.insert(topic.clone(), Vec::new());
        }
        plan.insert(member_id.clone(), partitions);
    }
    plan
}

/// Subscribed topics in a stable order, with their sorted partitions.
fn subscribed_partitions<'a>(
    members: &HashMap<MemberId, Subscription>,
    topics: &'a HashMap<String, Vec<PartitionId>>,
) -> BTreeMap<&'a String, Vec<PartitionId>> {
    let mut subscribed = BTreeMap::new();
    for (topic, partitions) in topics {
        if !members.values().any(|s| s.topics.contains(topic)) {
            continue;
        }
        if partitions.is_empty() {
            debug!("skipping assignment for topic {topic} since it has no partitions");
            continue;
        }
        let mut partitions = partitions.clone();
        partitions.sort_unstable();
        partitions.dedup();
        subscribed.insert(topic, partitions);
    }
    subscribed
}

/// Checks that `plan` is a complete, non-overlapping cover of every subscribed partition,
/// only handing partitions to members of the generation subscribed to their topic.
pub fn validate_plan(
    assignor: &str,
    plan: &AssignmentPlan,
    members: &HashMap<MemberId, Subscription>,
    topics: &HashMap<String, Vec<PartitionId>>,
) -> Result<()> {
    let invalid = |reason: String| Error::Assignment {
        assignor: assignor.to_string(),
        reason,
    };

    let mut owners: HashMap<TopicPartition, &MemberId> = HashMap::new();
    for (member_id, partitions) in plan {
        let subscription = members
            .get(member_id)
            .ok_or_else(|| invalid(format!("member {member_id} is not part of the group")))?;
        for (topic, partitions) in partitions {
            if partitions.is_empty() {
                continue;
            }
            if !subscription.topics.contains(topic) {
                return Err(invalid(format!(
                    "member {member_id} got partitions of topic {topic} it does not subscribe to"
                )));
            }
            let known = topics
                .get(topic)
                .ok_or_else(|| invalid(format!("topic {topic} is unknown")))?;
            for partition in partitions {
                if !known.contains(partition) {
                    return Err(invalid(format!(
                        "partition {topic}-{partition} does not exist"
                    )));
                }
                let tp = TopicPartition::new(topic.clone(), *partition);
                if let Some(owner) = owners.insert(tp, member_id) {
                    return Err(invalid(format!(
                        "partition {topic}-{partition} is assigned to both {owner} and \
                         {member_id}"
                    )));
                }
            }
        }
    }

    for (topic, partitions) in subscribed_partitions(members, topics) {
        for partition in partitions {
            if !owners.contains_key(&TopicPartition::new(topic.clone(), partition)) {
                return Err(invalid(format!("partition {topic}-{partition} is not assigned")));
            }
        }
    }
    Ok(())
}

pub enum PartitionAssignor {
    Range(RangeAssignor),
    RoundRobin(RoundRobinAssignor),
    Sticky(StickyAssignor),
    /// A user strategy, usually wrapping one of the built-in ones.
    Custom(Box<dyn PartitionAssigner>),
}

impl PartitionAssignor {
    pub fn range() -> Self {
        PartitionAssignor::Range(RangeAssignor)
    }

    pub fn round_robin() -> Self {
        PartitionAssignor::RoundRobin(RoundRobinAssignor)
    }

    pub fn sticky() -> Self {
        PartitionAssignor::Sticky(StickyAssignor::default())
    }

    pub fn custom<A: PartitionAssigner + 'static>(assignor: A) -> Self {
        PartitionAssignor::Custom(Box::new(assignor))
    }
}

impl fmt::Debug for PartitionAssignor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionAssignor::Range(_) => f.write_str("Range"),
            PartitionAssignor::RoundRobin(_) => f.write_str("RoundRobin"),
            PartitionAssignor::Sticky(_) => f.write_str("Sticky"),
            PartitionAssignor::Custom(custom) => write!(f, "Custom({})", custom.name()),
        }
    }
}

impl PartitionAssigner for PartitionAssignor {
    fn name(&self) -> &str {
        match self {
            PartitionAssignor::Range(range) => range.name(),
            PartitionAssignor::RoundRobin(round_robin) => round_robin.name(),
            PartitionAssignor::Sticky(sticky) => sticky.name(),
            PartitionAssignor::Custom(custom) => custom.name(),
        }
    }

    fn plan(
        &mut self,
        members: &HashMap<MemberId, Subscription>,
        topics: &HashMap<String, Vec<PartitionId>>,
    ) -> Result<AssignmentPlan> {
        match self {
            PartitionAssignor::Range(range) => range.plan(members, topics),
            PartitionAssignor::RoundRobin(round_robin) => round_robin.plan(members, topics),
            PartitionAssignor::Sticky(sticky) => sticky.plan(members, topics),
            PartitionAssignor::Custom(custom) => custom.plan(members, topics),
        }
    }

    fn assignment_data(
        &mut self,
        member_id: &str,
        topics: &HashMap<String, Vec<PartitionId>>,
        generation_id: i32,
    ) -> Result<Option<Bytes>> {
        match self {
            PartitionAssignor::Range(range) => {
                range.assignment_data(member_id, topics, generation_id)
            }
            PartitionAssignor::RoundRobin(round_robin) => {
                round_robin.assignment_data(member_id, topics, generation_id)
            }
            PartitionAssignor::Sticky(sticky) => {
                sticky.assignment_data(member_id, topics, generation_id)
            }
            PartitionAssignor::Custom(custom) => {
                custom.assignment_data(member_id, topics, generation_id)
            }
        }
    }
}

/// The range assignor works on a per-topic basis. For each topic, we lay out the available
/// partitions in numeric order and the consumers in lexicographic order. We then divide the number
/// of partitions by the total number of consumers to determine the number of partitions to assign
/// to each consumer. If it does not evenly divide, then the first few consumers will have one extra
/// partition. For example, suppose there are two consumers C0 and C1, two topics t0 and t1, and
/// each topic has 3 partitions, resulting in partitions t0p0, t0p1, t0p2, t1p0, t1p1, and t1p2.
///
/// The assignment will be:
///
/// - C0: [t0p0, t0p1, t1p0, t1p1]
/// - C1: [t0p2, t1p2]
///
/// Members carrying a group instance id sort before the others, ordered by instance id, so static
/// members keep their ranges across restarts as long as the membership does not change.
#[derive(Debug, Clone, Default)]
pub struct RangeAssignor;

impl RangeAssignor {
    fn consumers_per_topic(
        members: &HashMap<MemberId, Subscription>,
    ) -> HashMap<&String, Vec<MemberInfo<'_>>> {
        let mut topic_to_consumers: HashMap<&String, Vec<MemberInfo>> = HashMap::new();
        for (member_id, subscription) in members {
            let member = MemberInfo {
                member_id,
                group_instance_id: subscription.group_instance_id.as_ref(),
            };
            for topic in &subscription.topics {
                match topic_to_consumers.entry(topic) {
                    Entry::Vacant(entry) => {
                        entry.insert(vec![member.clone()]);
                    }
                    Entry::Occupied(mut entry) => entry.get_mut().push(member.clone()),
                }
            }
        }
        topic_to_consumers
    }
}

impl PartitionAssigner for RangeAssignor {
    fn name(&self) -> &str {
        "range"
    }

    fn plan(
        &mut self,
        members: &HashMap<MemberId, Subscription>,
        topics: &HashMap<String, Vec<PartitionId>>,
    ) -> Result<AssignmentPlan> {
        let partitions_per_topic = subscribed_partitions(members, topics);
        let mut plan = empty_plan(members);

        for (topic, mut consumers) in Self::consumers_per_topic(members) {
            let partitions = match partitions_per_topic.get(topic) {
                Some(partitions) => partitions,
                None => continue,
            };
            consumers.sort_by(MemberInfo::sort);

            let num_partitions = partitions.len();
            let num_consumers = consumers.len();
            let num_partitions_per_consumer = num_partitions / num_consumers;
            let consumers_with_extra_partition = num_partitions % num_consumers;

            for (i, member) in consumers.iter().enumerate() {
                let start = num_partitions_per_consumer * i + min(i, consumers_with_extra_partition);
                let length = num_partitions_per_consumer
                    + usize::from(i < consumers_with_extra_partition);
                if let Some(assigned) = plan
                    .get_mut(member.member_id)
                    .and_then(|assignment| assignment.get_mut(topic))
                {
                    assigned.extend_from_slice(&partitions[start..start + length]);
                }
            }
        }
        Ok(plan)
    }
}

/// The round robin assignor lays out all the partitions, topic by topic, and hands them out
/// to the sorted members in turn. A member that does not subscribe to a topic is skipped
/// for that topic's partitions, so identical subscriptions give counts within one of each
/// other while heterogeneous ones may end up uneven.
///
/// With consumers C0 subscribed to t0, C1 to t0 and t1, C2 to t0, t1 and t2, where t0, t1, t2
/// have 1, 2 and 3 partitions:
///
/// - C0: [t0p0]
/// - C1: [t1p0]
/// - C2: [t1p1, t2p0, t2p1, t2p2]
#[derive(Debug, Clone, Default)]
pub struct RoundRobinAssignor;

impl PartitionAssigner for RoundRobinAssignor {
    fn name(&self) -> &str {
        "roundrobin"
    }

    fn plan(
        &mut self,
        members: &HashMap<MemberId, Subscription>,
        topics: &HashMap<String, Vec<PartitionId>>,
    ) -> Result<AssignmentPlan> {
        let mut plan = empty_plan(members);
        let sorted = sorted_members(members);
        if sorted.is_empty() {
            return Ok(plan);
        }

        let mut cursor = 0;
        for (topic, partitions) in subscribed_partitions(members, topics) {
            for partition in partitions {
                // subscribed_partitions only yields topics with at least one subscriber
                loop {
                    let member = &sorted[cursor % sorted.len()];
                    cursor += 1;
                    if let Some(assigned) = plan
                        .get_mut(member.member_id)
                        .and_then(|assignment| assignment.get_mut(topic))
                    {
                        assigned.push(partition);
                        break;
                    }
                }
            }
        }
        Ok(plan)
    }
}

/// The sticky assignor keeps the partition counts of the members as balanced as the
/// subscriptions allow and, within that constraint, leaves every partition with the member
/// that owned it in the previous generation.
///
/// Previous ownership comes from the `owned_partitions` members report when they join, the
/// claim of the member with the highest generation wins when two members report the same
/// partition. Partitions nobody reports fall back to the plan this instance computed last.
///
/// With C0: [t0p0, t1p1, t3p0], C1: [t0p1, t2p0, t3p1], C2: [t1p0, t2p1] and C1 leaving, the
/// sticky assignor only moves the partitions C1 owned:
///
/// - C0: [t0p0, t1p1, t3p0, t0p1]
/// - C2: [t1p0, t2p1, t2p0, t3p1]
#[derive(Debug, Clone, Default)]
pub struct StickyAssignor {
    previous: HashMap<TopicPartition, MemberId>,
}

impl StickyAssignor {
    fn previous_owners(
        &self,
        members: &HashMap<MemberId, Subscription>,
    ) -> HashMap<TopicPartition, MemberId> {
        let mut owners: HashMap<TopicPartition, (&MemberId, i32)> = HashMap::new();
        for member in sorted_members(members) {
            let subscription = &members[member.member_id];
            for (topic, partitions) in subscription.owned_partitions.iter() {
                for partition in partitions {
                    let tp = TopicPartition::new(topic.clone(), *partition);
                    match owners.entry(tp) {
                        Entry::Vacant(entry) => {
                            entry.insert((member.member_id, subscription.generation_id));
                        }
                        Entry::Occupied(mut entry) => {
                            if subscription.generation_id > entry.get().1 {
                                entry.insert((member.member_id, subscription.generation_id));
                            }
                        }
                    }
                }
            }
        }

        let mut previous: HashMap<TopicPartition, MemberId> = owners
            .into_iter()
            .map(|(tp, (member_id, _))| (tp, member_id.clone()))
            .collect();
        for (tp, member_id) in self.previous.iter() {
            if members.contains_key(member_id) && !previous.contains_key(tp) {
                previous.insert(tp.clone(), member_id.clone());
            }
        }
        previous
    }
}

impl PartitionAssigner for StickyAssignor {
    fn name(&self) -> &str {
        "sticky"
    }

    fn plan(
        &mut self,
        members: &HashMap<MemberId, Subscription>,
        topics: &HashMap<String, Vec<PartitionId>>,
    ) -> Result<AssignmentPlan> {
        let sorted = sorted_members(members);
        let order: HashMap<&MemberId, usize> = sorted
            .iter()
            .enumerate()
            .map(|(i, member)| (member.member_id, i))
            .collect();
        let eligible = |member_id: &MemberId, topic: &String| {
            members
                .get(member_id)
                .map(|subscription| subscription.topics.contains(topic))
                .unwrap_or(false)
        };

        let mut all_partitions = Vec::new();
        for (topic, partitions) in subscribed_partitions(members, topics) {
            for partition in partitions {
                all_partitions.push(TopicPartition::new(topic.clone(), partition));
            }
        }
        if sorted.is_empty() {
            return Ok(empty_plan(members));
        }
        let quota = (all_partitions.len() + sorted.len() - 1) / sorted.len();

        let previous = self.previous_owners(members);
        let mut previous_counts: HashMap<&MemberId, usize> = HashMap::new();
        let mut current: HashMap<&MemberId, Vec<TopicPartition>> = sorted
            .iter()
            .map(|member| (member.member_id, Vec::new()))
            .collect();
        let mut unassigned = Vec::new();

        for tp in all_partitions {
            match previous.get(&tp) {
                Some(owner) if eligible(owner, &tp.topic) => {
                    let owner = sorted[order[owner]].member_id;
                    *previous_counts.entry(owner).or_default() += 1;
                    match current.get_mut(owner) {
                        Some(owned) if owned.len() < quota => owned.push(tp),
                        _ => unassigned.push(tp),
                    }
                }
                _ => unassigned.push(tp),
            }
        }

        // partitions with the fewest candidates are placed first
        unassigned.sort_by_key(|tp| {
            sorted
                .iter()
                .filter(|member| eligible(member.member_id, &tp.topic))
                .count()
        });
        for tp in unassigned {
            let target = sorted
                .iter()
                .filter(|member| eligible(member.member_id, &tp.topic))
                .min_by_key(|member| {
                    (
                        current[member.member_id].len(),
                        previous_counts.get(member.member_id).copied().unwrap_or(0),
                        order[member.member_id],
                    )
                })
                .map(|member| member.member_id);
            if let Some(target) = target {
                if let Some(owned) = current.get_mut(target) {
                    owned.push(tp);
                }
            }
        }

        // move partitions from the most to the least loaded members until no move
        // narrows a gap bigger than one
        loop {
            let mut by_load: Vec<&MemberId> = current.keys().copied().collect();
            by_load.sort_by_key(|member_id| {
                (std::cmp::Reverse(current[member_id].len()), order[member_id])
            });

            let mut next_move = None;
            'search: for from in by_load.iter() {
                let from_count = current[from].len();
                for (index, tp) in current[from].iter().enumerate().rev() {
                    let target = by_load
                        .iter()
                        .filter(|to| {
                            eligible(**to, &tp.topic) && from_count > current[**to].len() + 1
                        })
                        .min_by_key(|to| (current[**to].len(), order[**to]));
                    if let Some(to) = target {
                        next_move = Some((*from, index, *to));
                        break 'search;
                    }
                }
            }

            match next_move {
                Some((from, index, to)) => {
                    let tp = current
                        .get_mut(from)
                        .map(|owned| owned.remove(index));
                    if let (Some(tp), Some(owned)) = (tp, current.get_mut(to)) {
                        owned.push(tp);
                    }
                }
                None => break,
            }
        }

        let mut plan = empty_plan(members);
        self.previous.clear();
        for (member_id, owned) in current {
            for tp in owned {
                self.previous.insert(tp.clone(), member_id.clone());
                if let Some(assigned) = plan
                    .get_mut(member_id)
                    .and_then(|assignment| assignment.get_mut(&tp.topic))
                {
                    assigned.push(tp.partition);
                }
            }
        }
        Ok(plan)
    }
}
