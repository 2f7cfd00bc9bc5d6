//! Full runs over localhost TCP: telecom servers, a Leader and Oversight
//! agencies, each in its own task.

#![allow(clippy::unwrap_used)]

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    time::Duration,
};

use chaining_core::{
    ChainError, GraphPartition, KeyMaterial, KeyStore, LeaderConfig, OversightConfig, RetryPolicy,
    RunReport, SearchParams, TelecomConfig, TelecomEndpoint, Topology, disclose::disclose,
    partition_path,
};
use chaining_node::{
    Leader, NodeError, Oversight, SystemEnv, TelecomServer, connect_with_retry,
    output::{self, Stripped},
};
use chaining_proto::{
    AgencyId, BatchQuery, PartyId, QueryType, ResponseBatch, TelecomId, UserId,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

const RUN_TIMEOUT: Duration = Duration::from_secs(30);

fn graph() -> BTreeMap<UserId, Vec<UserId>> {
    BTreeMap::from([
        (1, vec![2, 3, 4]),
        (2, vec![1, 5]),
        (3, vec![1, 6]),
        (4, vec![1]),
        (5, vec![2, 7]),
        (6, vec![3]),
        (7, vec![5]),
    ])
}

fn retry() -> RetryPolicy {
    RetryPolicy { max_tries: 20, delay_ms: 50 }
}

struct Deployment {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    topology: Topology,
    keys: KeyMaterial,
    telecoms: Vec<TelecomEndpoint>,
}

impl Deployment {
    /// Write keys and graph partitions, start one server per telecom.
    async fn start(topology: Topology) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        let keys = KeyMaterial::generate(topology, &mut ChaCha20Rng::seed_from_u64(11));
        keys.write(&root.join("keys")).unwrap();

        let mut telecoms = Vec::new();
        let parts = GraphPartition::split(&graph(), topology.telecoms);
        for (id, part) in topology.telecom_ids().zip(parts) {
            let graph_path = partition_path(&root, id);
            part.save(&graph_path).unwrap();

            let config = TelecomConfig {
                topology,
                id,
                key_dir: root.join("keys"),
                listen: "127.0.0.1:0".to_string(),
                graph: graph_path,
                max_workers: 2,
            };
            let server = TelecomServer::bind(&config, SystemEnv::new()).await.unwrap();
            let address = server.local_addr().unwrap().to_string();
            telecoms.push(TelecomEndpoint { id, address });
            tokio::spawn(server.run());
        }

        Self { _dir: dir, root, topology, keys, telecoms }
    }

    fn leader_config(&self, search: SearchParams) -> LeaderConfig {
        LeaderConfig {
            topology: self.topology,
            key_dir: self.root.join("keys"),
            listen: "127.0.0.1:0".to_string(),
            search,
            telecoms: self.telecoms.clone(),
            accept_timeout_secs: 10,
            output: Some(self.root.join("leader.out")),
            timing_log: Some(self.root.join("timing.csv")),
            retry: retry(),
        }
    }

    fn oversight_config(
        &self,
        agency: AgencyId,
        leader: &str,
        search: SearchParams,
    ) -> OversightConfig {
        OversightConfig {
            topology: self.topology,
            agency,
            key_dir: self.root.join("keys"),
            leader: leader.to_string(),
            search,
            output: Some(self.root.join(format!("{agency}.out"))),
            timing_log: None,
            retry: retry(),
        }
    }

    /// Run the Leader and every Oversight agency, each with its own
    /// authorized parameters.
    async fn run(
        &self,
        leader_search: SearchParams,
        oversight_search: impl Fn(AgencyId) -> SearchParams,
    ) -> (Result<RunReport, NodeError>, Vec<(AgencyId, Result<RunReport, NodeError>)>) {
        let leader =
            Leader::bind(self.leader_config(leader_search), SystemEnv::new()).await.unwrap();
        let address = leader.local_addr().unwrap().to_string();
        let leader = tokio::spawn(leader.run());

        let agencies: Vec<_> = self
            .topology
            .agency_ids()
            .filter(|agency| !agency.is_leader())
            .map(|agency| {
                let config = self.oversight_config(agency, &address, oversight_search(agency));
                let oversight = Oversight::new(config, SystemEnv::new()).unwrap();
                (agency, tokio::spawn(oversight.run()))
            })
            .collect();

        let leader_result = tokio::time::timeout(RUN_TIMEOUT, leader).await.unwrap().unwrap();
        let mut oversight_results = Vec::new();
        for (agency, handle) in agencies {
            let result = tokio::time::timeout(RUN_TIMEOUT, handle).await.unwrap().unwrap();
            oversight_results.push((agency, result));
        }
        (leader_result, oversight_results)
    }

    fn disclose_all(&self, report: &RunReport) -> BTreeSet<UserId> {
        let stores: Vec<_> = self
            .topology
            .agency_ids()
            .map(|agency| self.keys.store_for(PartyId::Agency(agency)).unwrap())
            .collect();
        let refs: Vec<_> = stores.iter().rev().collect();
        report.outputs().iter().map(|value| disclose(&refs, value).unwrap()).collect()
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.root.join(name)
    }

    /// Load an agency's keys from the written key directory.
    fn load_keys(&self, agency: u32) -> KeyStore {
        let me = PartyId::Agency(AgencyId(agency));
        KeyStore::load(&self.root.join("keys"), me, self.topology).unwrap()
    }
}

fn assert_file_matches(path: &Path, report: &RunReport) {
    assert_eq!(output::read_outputs(path).unwrap(), report.outputs);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_hop_search_with_two_oversight_agencies() {
    let deployment = Deployment::start(Topology { agencies: 3, telecoms: 2 }).await;
    let search = SearchParams { target: 1, max_distance: 2, max_degree: 10 };

    let (leader, oversight) = deployment.run(search, |_| search).await;
    let report = leader.unwrap();

    assert_eq!(deployment.disclose_all(&report), BTreeSet::from([1, 2, 3, 4, 5, 6]));
    assert_eq!(report.outputs.len(), 6);
    assert_eq!(report.target_degree, Some(3));
    assert_eq!(report.rounds, 3);
    assert_eq!(report.audits.len(), 2);
    assert!(report.all_audits_passed());
    assert!(report.bytes_sent > 0 && report.bytes_received > 0);
    assert_file_matches(&deployment.path("leader.out"), &report);

    for (agency, result) in oversight {
        let audit = result.unwrap();
        assert_eq!(audit.outputs, report.outputs, "{agency} diverged from the leader");
        assert!(audit.audits[&agency].is_passed());
        assert_file_matches(&deployment.path(&format!("{agency}.out")), &audit);
    }

    let timing = std::fs::read_to_string(deployment.path("timing.csv")).unwrap();
    assert_eq!(timing.lines().count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn degree_limit_stops_expansion_past_the_target() {
    let deployment = Deployment::start(Topology { agencies: 2, telecoms: 2 }).await;
    let search = SearchParams { target: 1, max_distance: 2, max_degree: 1 };

    let (leader, oversight) = deployment.run(search, |_| search).await;
    let report = leader.unwrap();

    // The target's 3 neighbors are exempt; each of their lists exceeds 1
    // except user 4, whose only neighbor was already disclosed.
    assert_eq!(deployment.disclose_all(&report), BTreeSet::from([1, 2, 3, 4]));
    assert!(report.all_audits_passed());
    assert!(oversight.into_iter().all(|(_, result)| result.is_ok()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_alone_needs_no_oversight() {
    let deployment = Deployment::start(Topology { agencies: 1, telecoms: 1 }).await;
    let search = SearchParams { target: 5, max_distance: 1, max_degree: u32::MAX };

    let (leader, oversight) = deployment.run(search, |_| search).await;
    let report = leader.unwrap();

    assert!(oversight.is_empty());
    assert!(report.audits.is_empty());
    assert_eq!(deployment.disclose_all(&report), BTreeSet::from([2, 5, 7]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversight_refuses_a_different_target() {
    let deployment = Deployment::start(Topology { agencies: 3, telecoms: 2 }).await;
    let leader_search = SearchParams { target: 1, max_distance: 1, max_degree: 10 };
    let other_target = SearchParams { target: 6, ..leader_search };

    let (leader, oversight) = deployment
        .run(leader_search, |agency| {
            if agency == AgencyId(2) { other_target } else { leader_search }
        })
        .await;

    assert!(leader.is_err());
    assert!(matches!(
        leader,
        Err(NodeError::Chain(ChainError::Refused { agency: AgencyId(2), .. })
            | NodeError::Transport(_))
    ));

    let refusing = oversight.iter().find(|(agency, _)| *agency == AgencyId(2)).unwrap();
    assert!(matches!(refusing.1, Err(NodeError::Chain(ChainError::Audit { .. }))));
    assert!(!deployment.path("leader.out").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversight_signature_does_not_cover_a_longer_search() {
    let deployment = Deployment::start(Topology { agencies: 2, telecoms: 2 }).await;
    let leader_search = SearchParams { target: 1, max_distance: 2, max_degree: 10 };
    let authorized = SearchParams { max_distance: 1, ..leader_search };

    // The agency signs CONCLUDE batches for distance 1 where the Leader built
    // SEARCH batches, so its signatures do not verify.
    let (leader, oversight) = deployment.run(leader_search, |_| authorized).await;

    assert!(matches!(
        leader,
        Err(NodeError::Chain(ChainError::Signature { signer: PartyId::Agency(AgencyId(1)), .. }))
    ));
    assert!(oversight[0].1.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversight_refuses_initial_query_of_the_wrong_type() {
    let deployment = Deployment::start(Topology { agencies: 2, telecoms: 2 }).await;
    let leader_search = SearchParams { target: 1, max_distance: 1, max_degree: 10 };
    let lookup_only = SearchParams { max_distance: 0, ..leader_search };

    let (leader, oversight) = deployment.run(leader_search, |_| lookup_only).await;

    assert!(matches!(
        leader,
        Err(NodeError::Chain(ChainError::Refused { agency: AgencyId(1), .. }))
    ));
    assert!(matches!(oversight[0].1, Err(NodeError::Chain(ChainError::Audit { .. }))));
}

#[tokio::test]
async fn telecom_rejects_unsigned_batch_and_closes() {
    let deployment = Deployment::start(Topology { agencies: 2, telecoms: 1 }).await;
    let leader_keys = deployment.keys.store_for(PartyId::Agency(AgencyId::LEADER)).unwrap();

    let mut rng = ChaCha20Rng::seed_from_u64(3);
    let token = leader_keys.encrypt_for_telecom(TelecomId(0), 1, &mut rng).unwrap();
    let mut batch = BatchQuery::new(TelecomId(0), QueryType::Search, vec![token]);
    batch.add_signature(AgencyId::LEADER, leader_keys.sign(&batch.signing_payload().unwrap()));

    let address = &deployment.telecoms[0].address;
    let mut conn = connect_with_retry(&SystemEnv::new(), address, retry()).await.unwrap();
    conn.send(&batch).await.unwrap();
    let response: ResponseBatch = conn.recv().await.unwrap();

    assert!(response.is_rejected());
    assert_eq!(conn.recv_optional::<ResponseBatch>().await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn agencies_strip_the_output_file_in_any_order() {
    let deployment = Deployment::start(Topology { agencies: 3, telecoms: 2 }).await;
    let search = SearchParams { target: 3, max_distance: 1, max_degree: 10 };

    let (leader, _) = deployment.run(search, |_| search).await;
    assert_eq!(leader.unwrap().outputs.len(), 3);

    let mut current = deployment.path("leader.out");
    let mut last = None;
    for (step, agency) in [2, 0, 1].into_iter().enumerate() {
        let next = deployment.path(&format!("leader.out.{step}"));
        let stripped =
            output::strip_output_file(&deployment.load_keys(agency), &current, &next).unwrap();
        if step < 2 {
            assert_eq!(stripped, Stripped::Partial { values: 3, layers_left: 2 - step });
        }
        last = Some(stripped);
        current = next;
    }

    let revealed: BTreeSet<UserId> = match last {
        Some(Stripped::Revealed(users)) => users.into_iter().collect(),
        _ => BTreeSet::new(),
    };
    assert_eq!(revealed, BTreeSet::from([1, 3, 6]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn agency_cannot_strip_its_layer_twice() {
    let deployment = Deployment::start(Topology { agencies: 2, telecoms: 1 }).await;
    let search = SearchParams { target: 2, max_distance: 1, max_degree: 10 };
    deployment.run(search, |_| search).await.0.unwrap();

    let keys = deployment.load_keys(1);
    let once = deployment.path("leader.out.once");
    output::strip_output_file(&keys, &deployment.path("leader.out"), &once).unwrap();

    let twice = output::strip_output_file(&keys, &once, &deployment.path("leader.out.twice"));
    assert!(twice.is_err());
}
