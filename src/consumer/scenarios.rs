//! End-to-end behaviour of several consumers sharing one coordination ensemble and one broker

use super::{broker::mock::MockBroker, handler_fn, BatchContext, Consumer, ConsumerConfig, ConsumerConfigBuilder};
use crate::domain::{Cursor, HandlerErrorPolicy};
use crate::library::{
    coordination::{
        memory::{MemoryCoordinationStore, MemoryEnsemble},
        CoordinationStore, CoordinationStoreExt,
    },
    EmptyResult,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::{sleep, timeout};

const CONVERGENCE: Duration = Duration::from_secs(10);

macro_rules! eventually {
    ($what:expr, $condition:expr) => {
        let converged = timeout(CONVERGENCE, async {
            loop {
                if $condition {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        assert!(converged.is_ok(), "{} never converged", $what);
    };
}

/// One consuming process
struct Process {
    consumer: Consumer,
    store: Arc<MemoryCoordinationStore>,
    handled: Arc<Mutex<Vec<(String, String)>>>,
}

impl Process {
    fn spawn(ensemble: &MemoryEnsemble, broker: &Arc<MockBroker>, member: &str) -> Self {
        Self::spawn_with(ensemble, broker, member, false, |builder| builder)
    }

    fn spawn_with(
        ensemble: &MemoryEnsemble,
        broker: &Arc<MockBroker>,
        member: &str,
        refuse_batches: bool,
        configure: impl FnOnce(ConsumerConfigBuilder) -> ConsumerConfigBuilder,
    ) -> Self {
        let handled = Arc::new(Mutex::new(Vec::new()));
        let record = handled.clone();

        let handler = handler_fn(move |context: BatchContext, _: Vec<Value>| {
            record
                .lock()
                .unwrap()
                .push((context.partition.to_string(), context.cursor.offset.clone()));

            let result: EmptyResult = if refuse_batches {
                Err("refusing batch".into())
            } else {
                Ok(())
            };

            async move { result }
        });

        let builder = ConsumerConfig::builder("c1")
            .handler("orders", handler)
            .member_id(member)
            .discovery_interval(Duration::from_millis(25))
            .session_timeout(Duration::from_millis(200));

        let store = Arc::new(ensemble.connect());
        let consumer = Consumer::new(configure(builder).build().unwrap(), store.clone(), broker.clone()).unwrap();

        Self {
            consumer,
            store,
            handled,
        }
    }

    fn handled(&self) -> Vec<(String, String)> {
        self.handled.lock().unwrap().clone()
    }

    async fn workers(&self) -> Vec<String> {
        self.consumer.health().await.workers.into_keys().collect()
    }

    async fn leads_orders(&self) -> bool {
        self.consumer
            .health()
            .await
            .leaderships
            .iter()
            .any(|event_type| event_type.as_str() == "orders")
    }
}

fn handled(partition: &str, offsets: &[&str]) -> Vec<(String, String)> {
    offsets
        .iter()
        .map(|offset| (partition.to_owned(), offset.to_string()))
        .collect()
}

async fn assignments(store: &MemoryCoordinationStore) -> BTreeMap<String, String> {
    let root = "/consumers/c1/assignments/orders";
    let mut assignments = BTreeMap::new();

    for partition in store.children_if_exists(root).await.unwrap_or_default() {
        let path = format!("{}/{}", root, partition);
        if let Ok(Some(owner)) = store.get_data_if_exists(&path).await {
            assignments.insert(partition, String::from_utf8(owner).unwrap());
        }
    }

    assignments
}

fn expected(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(partition, member)| (partition.to_string(), member.to_string()))
        .collect()
}

async fn committed(store: &MemoryCoordinationStore, partition: &str) -> Option<String> {
    let path = format!("/consumers/c1/offsets/orders/{}", partition);
    let raw = store.get_data_if_exists(&path).await.ok()??;
    serde_json::from_slice::<Cursor>(&raw).ok().map(|cursor| cursor.offset)
}

async fn load(store: &MemoryCoordinationStore) -> BTreeMap<String, usize> {
    let mut load = BTreeMap::new();
    for member in assignments(store).await.into_values() {
        *load.entry(member).or_default() += 1;
    }
    load
}

async fn leader(store: &MemoryCoordinationStore) -> Option<String> {
    let raw = store.get_data_if_exists("/consumers/c1/leader/orders").await.ok()??;
    String::from_utf8(raw).ok()
}

#[tokio::test]
async fn consume_a_single_partition_in_order() {
    let ensemble = MemoryEnsemble::new();
    let observer = ensemble.connect();
    let broker = Arc::new(MockBroker::default());
    broker.set_partitions("orders", &["0"]);
    broker.publish("orders", "0", "10", vec![json!({ "order": 1 })]);
    broker.publish("orders", "0", "20", vec![json!({ "order": 2 })]);

    let m1 = Process::spawn(&ensemble, &broker, "m1");
    m1.consumer.start().await.unwrap();

    eventually!("offset commit", committed(&observer, "0").await.as_deref() == Some("20"));
    assert_eq!(m1.handled(), handled("0", &["10", "20"]));

    assert!(m1.consumer.stop().await.is_clean());
}

#[tokio::test]
async fn split_partitions_between_two_members() {
    let ensemble = MemoryEnsemble::new();
    let observer = ensemble.connect();
    let broker = Arc::new(MockBroker::default());
    broker.set_partitions("orders", &["0", "1"]);

    let m1 = Process::spawn(&ensemble, &broker, "m1");
    let m2 = Process::spawn(&ensemble, &broker, "m2");
    m1.consumer.start().await.unwrap();
    m2.consumer.start().await.unwrap();

    eventually!(
        "assignments",
        assignments(&observer).await == expected(&[("0", "m1"), ("1", "m2")])
    );
    eventually!("m1 workers", m1.workers().await == vec!["orders/0".to_owned()]);
    eventually!("m2 workers", m2.workers().await == vec!["orders/1".to_owned()]);

    m1.consumer.stop().await;
    m2.consumer.stop().await;
}

#[tokio::test]
async fn fail_over_when_the_leader_dies() {
    let ensemble = MemoryEnsemble::new();
    let observer = ensemble.connect();
    let broker = Arc::new(MockBroker::default());
    broker.set_partitions("orders", &["0", "1"]);

    let m1 = Process::spawn(&ensemble, &broker, "m1");
    m1.consumer.start().await.unwrap();
    eventually!("m1 leadership", leader(&observer).await.as_deref() == Some("m1"));

    let m2 = Process::spawn(&ensemble, &broker, "m2");
    m2.consumer.start().await.unwrap();
    eventually!(
        "initial assignments",
        assignments(&observer).await == expected(&[("0", "m1"), ("1", "m2")])
    );

    m1.store.kill_session().await;

    eventually!("m2 leadership", m2.leads_orders().await);
    eventually!(
        "failover assignments",
        assignments(&observer).await == expected(&[("0", "m2"), ("1", "m2")])
    );
    eventually!("m2 workers", m2.workers().await.len() == 2);
    eventually!("m1 workers", m1.workers().await.is_empty());

    m2.consumer.stop().await;
    m1.consumer.stop().await;
}

#[tokio::test]
async fn resume_at_the_last_commit_after_a_crash() {
    let ensemble = MemoryEnsemble::new();
    let observer = ensemble.connect();
    let broker = Arc::new(MockBroker::default());
    broker.set_partitions("orders", &["0"]);
    broker.publish("orders", "0", "10", vec![json!({ "order": 1 })]);

    let crashed = Process::spawn(&ensemble, &broker, "m1");
    crashed.consumer.start().await.unwrap();
    eventually!("first commit", committed(&observer, "0").await.as_deref() == Some("10"));

    crashed.store.kill_session().await;
    broker.publish("orders", "0", "20", vec![json!({ "order": 2 })]);

    let restarted = Process::spawn(&ensemble, &broker, "m1");
    restarted.consumer.start().await.unwrap();

    eventually!("second commit", committed(&observer, "0").await.as_deref() == Some("20"));
    assert_eq!(broker.opened("orders", "0").last().map(String::as_str), Some("10"));
    assert_eq!(restarted.handled(), handled("0", &["20"]));
    assert_eq!(crashed.handled(), handled("0", &["10"]));

    restarted.consumer.stop().await;
    crashed.consumer.stop().await;
}

#[tokio::test]
async fn move_a_failing_partition_to_another_member() {
    let ensemble = MemoryEnsemble::new();
    let observer = ensemble.connect();
    let broker = Arc::new(MockBroker::default());
    broker.set_partitions("orders", &["0"]);
    broker.publish("orders", "0", "10", vec![json!({ "order": 1 })]);

    let fail_fast = |builder: ConsumerConfigBuilder| builder.handler_error_policy(HandlerErrorPolicy::Fail);
    let m1 = Process::spawn_with(&ensemble, &broker, "m1", true, fail_fast);
    let m2 = Process::spawn_with(&ensemble, &broker, "m2", false, fail_fast);

    // m2 joins once m1 has picked up the partition, so m1 is guaranteed to see the batch first
    m1.consumer.start().await.unwrap();
    eventually!("m1 attempt", !m1.handled().is_empty());
    m2.consumer.start().await.unwrap();

    eventually!("reassignment", assignments(&observer).await == expected(&[("0", "m2")]));
    eventually!("commit by m2", committed(&observer, "0").await.as_deref() == Some("10"));

    assert_eq!(m1.handled(), handled("0", &["10"]));
    assert_eq!(m2.handled(), handled("0", &["10"]));
    assert!(observer
        .exists("/consumers/c1/failures/orders/0/m1")
        .await
        .unwrap());

    eventually!("m1 workers", m1.workers().await.is_empty());
    eventually!(
        "both members in the election",
        observer
            .children_if_exists("/consumers/c1/election/orders")
            .await
            .unwrap()
            .len()
            == 2
    );

    m1.consumer.stop().await;
    m2.consumer.stop().await;

    assert!(!observer
        .exists("/consumers/c1/failures/orders/0/m1")
        .await
        .unwrap());
}

#[tokio::test]
async fn pick_up_partitions_added_at_runtime() {
    let ensemble = MemoryEnsemble::new();
    let observer = ensemble.connect();
    let broker = Arc::new(MockBroker::default());
    broker.set_partitions("orders", &["0"]);

    let m1 = Process::spawn(&ensemble, &broker, "m1");
    m1.consumer.start().await.unwrap();
    eventually!("initial assignments", assignments(&observer).await == expected(&[("0", "m1")]));

    broker.set_partitions("orders", &["0", "1"]);

    eventually!(
        "extended assignments",
        assignments(&observer).await == expected(&[("0", "m1"), ("1", "m1")])
    );
    eventually!("new worker", m1.workers().await.len() == 2);
    assert_eq!(broker.opened("orders", "1"), vec!["BEGIN".to_owned()]);

    m1.consumer.stop().await;
}

#[tokio::test]
async fn elect_a_single_leader_and_balance_the_load() {
    let ensemble = MemoryEnsemble::new();
    let observer = ensemble.connect();
    let broker = Arc::new(MockBroker::default());
    broker.set_partitions("orders", &["0", "1", "2", "3", "4", "5", "6"]);

    let processes: Vec<Process> = ["m1", "m2", "m3"]
        .iter()
        .map(|member| Process::spawn(&ensemble, &broker, member))
        .collect();

    for process in processes.iter() {
        process.consumer.start().await.unwrap();
    }

    eventually!("balanced assignments", {
        let load = load(&observer).await;
        let max = load.values().max().copied().unwrap_or_default();
        let min = load.values().min().copied().unwrap_or_default();
        load.len() == 3 && load.values().sum::<usize>() == 7 && max - min <= 1
    });

    let mut leaders = Vec::new();
    for process in processes.iter() {
        if process.leads_orders().await {
            leaders.push(process.consumer.member_id().to_string());
        }
    }
    assert_eq!(leaders.len(), 1);
    assert_eq!(leader(&observer).await, leaders.pop());

    let mut reports = Vec::new();
    for process in processes.iter() {
        reports.push(process.consumer.stop().await);
    }
    assert!(reports.iter().all(|report| report.is_clean()));
}

#[tokio::test]
async fn never_commit_backwards() {
    let ensemble = MemoryEnsemble::new();
    let observer = ensemble.connect();
    let broker = Arc::new(MockBroker::default());
    broker.set_partitions("orders", &["0"]);

    let offsets: Vec<String> = (1..=25).map(|offset| format!("001-0001-{:012}", offset * 7)).collect();
    for offset in offsets.iter() {
        broker.publish("orders", "0", offset, vec![json!({ "offset": offset })]);
    }

    let m1 = Process::spawn(&ensemble, &broker, "m1");
    m1.consumer.start().await.unwrap();

    let last = offsets.last().cloned();
    let mut observed: Vec<String> = Vec::new();
    eventually!("final commit", {
        if let Some(current) = committed(&observer, "0").await {
            if observed.last() != Some(&current) {
                observed.push(current);
            }
        }
        observed.last() == last.as_ref()
    });

    let positions: Vec<usize> = observed
        .iter()
        .map(|offset| offsets.iter().position(|o| o == offset).unwrap())
        .collect();
    assert!(positions.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", observed);

    let delivered: Vec<String> = m1.handled().into_iter().map(|(_, offset)| offset).collect();
    assert_eq!(delivered, offsets);

    m1.consumer.stop().await;
}
