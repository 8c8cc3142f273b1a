// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Multi-peer protocol tests against the in-memory transport.

use eyre::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use treeline::memory::MemoryNetwork;
use treeline::{
    ComparisonOp, Config, Entry, EventStream, Expression, FindQuery, Node, NodeState, Position,
    Selection, Value, ValueType,
};

const SETTLE: Duration = Duration::from_millis(400);
const FIND_DEADLINE: Duration = Duration::from_secs(10);

fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn addr(index: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9100 + index))
}

async fn start_node(
    network: &Arc<MemoryNetwork>,
    config: Config,
) -> Result<(Node, EventStream)> {
    init_logger();
    let (incoming_tx, incoming_rx) = mpsc::channel(256);
    let transport = network.endpoint(config.local_addr, incoming_tx);
    let started = Node::with_transport(config, transport, incoming_rx).await?;
    Ok(started)
}

async fn start_root(network: &Arc<MemoryNetwork>) -> Result<(Node, EventStream)> {
    start_node(network, Config::root(addr(0))).await
}

async fn start_joiner(
    network: &Arc<MemoryNetwork>,
    index: u16,
    contact: u16,
) -> Result<(Node, EventStream)> {
    start_node(network, Config::joining(addr(index), addr(contact))).await
}

fn position(level: u32, number: u32) -> Position {
    Position::new(level, number, 2).expect("valid position")
}

#[tokio::test(flavor = "multi_thread")]
async fn first_joiner_becomes_the_roots_left_child() -> Result<()> {
    let network = MemoryNetwork::new();
    let (root, _root_events) = start_root(&network).await?;
    assert_eq!(root.state(), NodeState::Connected);
    assert_eq!(root.local_node().position(), position(0, 0));

    let (joiner, _events) = start_joiner(&network, 1, 0).await?;
    assert_eq!(joiner.state(), NodeState::Connected);
    assert_eq!(joiner.local_node().position(), position(1, 0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn joins_fill_the_tree_in_level_order() -> Result<()> {
    let network = MemoryNetwork::new();
    let (_root, _root_events) = start_root(&network).await?;

    let mut peers = Vec::new();
    for index in 1..=5u16 {
        // every joiner uses the root as contact; the join is forwarded to
        // wherever the insertion position lives
        let (node, events) = start_joiner(&network, index, 0).await?;
        sleep(SETTLE).await;
        peers.push((node, events));
    }

    let expected = [
        position(1, 0),
        position(1, 1),
        position(2, 0),
        position(2, 1),
        position(2, 2),
    ];
    for ((node, _), expected) in peers.iter().zip(expected) {
        assert_eq!(node.local_node().position(), expected);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn join_via_inner_contact_still_lands_on_the_leftmost_slot() -> Result<()> {
    let network = MemoryNetwork::new();
    let (_root, _root_events) = start_root(&network).await?;
    let (_a, _ea) = start_joiner(&network, 1, 0).await?;
    let (_b, _eb) = start_joiner(&network, 2, 0).await?;
    sleep(SETTLE).await;

    // contact is 1:1, but the insertion position is 2:0 below 1:0
    let (c, _ec) = start_joiner(&network, 3, 2).await?;
    assert_eq!(c.local_node().position(), position(2, 0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn find_locates_peers_by_string_attribute() -> Result<()> {
    let network = MemoryNetwork::new();
    let (_root, _root_events) = start_root(&network).await?;
    let (a, _ea) = start_joiner(&network, 1, 0).await?;
    let (b, _eb) = start_joiner(&network, 2, 0).await?;
    sleep(SETTLE).await;

    a.insert(vec![Entry::new("wetter", "schlecht", ValueType::Dynamic)])
        .await?;
    sleep(SETTLE).await;

    let query = FindQuery::new(
        Expression::has("wetter").and(Expression::string_eq("wetter", "schlecht")),
    )
    .with_validity_threshold(60_000)
    .with_selection(Selection::AllAttributes);

    let result = timeout(FIND_DEADLINE, b.find(query)).await??;
    assert_eq!(result.len(), 1);
    let (found, attributes) = &result[0];
    assert_eq!(found.position(), a.local_node().position());
    assert!(attributes.contains(&("wetter".to_string(), Value::from("schlecht"))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn numeric_comparisons_discriminate_threshold() -> Result<()> {
    let network = MemoryNetwork::new();
    let (_root, _root_events) = start_root(&network).await?;
    let (a, _ea) = start_joiner(&network, 1, 0).await?;
    let (b, _eb) = start_joiner(&network, 2, 0).await?;
    sleep(SETTLE).await;

    b.insert(vec![Entry::new("pos_x", 100, ValueType::Dynamic)])
        .await?;
    sleep(SETTLE).await;

    let hits = timeout(
        FIND_DEADLINE,
        a.find(
            FindQuery::new(Expression::num_cmp("pos_x", ComparisonOp::Ge, 100))
                .with_validity_threshold(60_000),
        ),
    )
    .await??;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0.position(), b.local_node().position());

    let misses = timeout(
        FIND_DEADLINE,
        a.find(
            FindQuery::new(Expression::num_cmp("pos_x", ComparisonOp::Ge, 101))
                .with_validity_threshold(60_000),
        ),
    )
    .await??;
    assert!(misses.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn value_semantics_hold_at_the_facade() -> Result<()> {
    let network = MemoryNetwork::new();
    let (root, _root_events) = start_root(&network).await?;

    root.insert(vec![Entry::new("vendor", "acme", ValueType::Static)])
        .await?;
    // repeated insert reports "already present"
    assert!(root
        .insert(vec![Entry::new("vendor", "acme", ValueType::Static)])
        .await
        .is_err());
    // static values never change
    assert!(root
        .update(vec![Entry::new("vendor", "emca", ValueType::Static)])
        .await
        .is_err());
    // the same value is an accepted no-op
    root.update(vec![Entry::new("vendor", "acme", ValueType::Static)])
        .await?;
    // the value type of a key is fixed at insert
    root.insert(vec![Entry::new("speed", 5, ValueType::Dynamic)])
        .await?;
    assert!(root
        .update(vec![Entry::new("speed", 6, ValueType::Static)])
        .await
        .is_err());
    root.update(vec![Entry::new("speed", 6, ValueType::Dynamic)])
        .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn last_peer_leaves_directly_and_frees_its_slot() -> Result<()> {
    let network = MemoryNetwork::new();
    let (_root, _root_events) = start_root(&network).await?;
    let (a, _ea) = start_joiner(&network, 1, 0).await?;
    sleep(SETTLE).await;

    a.stop().await?;
    assert_eq!(a.state(), NodeState::Idle);
    network.disconnect(&addr(1));
    sleep(SETTLE).await;

    // the slot is open again
    let (b, _eb) = start_joiner(&network, 2, 0).await?;
    assert_eq!(b.local_node().position(), position(1, 0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn leaving_in_the_middle_elects_the_last_peer_as_replacement() -> Result<()> {
    let network = MemoryNetwork::new();
    let (_root, _root_events) = start_root(&network).await?;
    let (a, _ea) = start_joiner(&network, 1, 0).await?;
    let (b, _eb) = start_joiner(&network, 2, 0).await?;
    sleep(SETTLE).await;

    // 1:0 leaves; 1:1 is the last peer in level order and moves over
    a.stop().await?;
    network.disconnect(&addr(1));
    sleep(SETTLE).await;

    assert_eq!(b.local_node().position(), position(1, 0));

    // the vacated slot 1:1 is the next insertion position
    let (c, _ec) = start_joiner(&network, 3, 0).await?;
    assert_eq!(c.local_node().position(), position(1, 1));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn replacement_peer_still_answers_queries() -> Result<()> {
    let network = MemoryNetwork::new();
    let (root, _root_events) = start_root(&network).await?;
    let (a, _ea) = start_joiner(&network, 1, 0).await?;
    let (b, _eb) = start_joiner(&network, 2, 0).await?;
    sleep(SETTLE).await;

    b.insert(vec![Entry::new("topicA", true, ValueType::Dynamic)])
        .await?;
    sleep(SETTLE).await;

    a.stop().await?;
    network.disconnect(&addr(1));
    sleep(SETTLE).await;

    let result = timeout(
        FIND_DEADLINE,
        root.find(FindQuery::new(Expression::has("topicA")).with_validity_threshold(60_000)),
    )
    .await??;
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].0.position(), b.local_node().position());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_is_idempotent() -> Result<()> {
    let network = MemoryNetwork::new();
    let (root, _root_events) = start_root(&network).await?;
    root.stop().await?;
    root.stop().await?;
    assert_eq!(root.state(), NodeState::Idle);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn find_with_no_matches_returns_empty() -> Result<()> {
    let network = MemoryNetwork::new();
    let (_root, _root_events) = start_root(&network).await?;
    let (a, _ea) = start_joiner(&network, 1, 0).await?;
    sleep(SETTLE).await;

    let result = timeout(
        FIND_DEADLINE,
        a.find(FindQuery::new(Expression::string_eq("wetter", "gut"))),
    )
    .await??;
    assert!(result.is_empty());
    Ok(())
}
