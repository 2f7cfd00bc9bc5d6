//! In-process protocol runs: one Leader, two Oversight agencies, two
//! telecoms, no sockets.
//!
//! Every test drives the same loop the node drivers run over TCP, so the
//! admission rule, signature gating and frontier agreement between agencies
//! are exercised end to end against real crypto.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use chaining_core::{
    ChainError, ChainState, GraphPartition, KeyMaterial, KeyStore, Responder, Role, RoundSummary,
    SearchParams, Session, Topology, disclose::disclose,
};
use chaining_proto::{
    AgencyId, BatchQuery, PartyId, QueryType, ResponseBatch, TelecomId, TokenResponse, UserId,
    owner_of,
};
use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

const TOPOLOGY: Topology = Topology { agencies: 3, telecoms: 2 };

struct World {
    leader: KeyStore,
    oversight: Vec<(AgencyId, KeyStore)>,
    responders: Vec<Responder>,
    sessions: Vec<Session>,
    rng: ChaCha20Rng,
}

#[derive(Debug)]
struct Outcome {
    users: BTreeSet<UserId>,
    summaries: Vec<RoundSummary>,
    query_types: Vec<QueryType>,
}

impl World {
    fn new(graph: &BTreeMap<UserId, Vec<UserId>>, seed: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let material = KeyMaterial::generate(TOPOLOGY, &mut rng);

        let responders = GraphPartition::split(graph, TOPOLOGY.telecoms)
            .into_iter()
            .zip(TOPOLOGY.telecom_ids())
            .map(|(part, id)| {
                let keys = material.store_for(PartyId::Telecom(id)).unwrap();
                Responder::new(id, Arc::new(keys), Arc::new(part), 4)
            })
            .collect();

        Self {
            leader: material.store_for(PartyId::Agency(AgencyId::LEADER)).unwrap(),
            oversight: (1..TOPOLOGY.agencies)
                .map(|i| (AgencyId(i), material.store_for(PartyId::Agency(AgencyId(i))).unwrap()))
                .collect(),
            responders,
            sessions: TOPOLOGY.telecom_ids().map(|_| Session::new()).collect(),
            rng,
        }
    }

    fn dispatch(&mut self, state: &ChainState) -> Vec<ResponseBatch> {
        state
            .pending()
            .values()
            .map(|batch| {
                let t = batch.telecom.0 as usize;
                self.responders[t].respond(&mut self.sessions[t], batch, &mut self.rng).unwrap()
            })
            .collect()
    }

    /// Run with the Leader and Oversight agencies sharing `params`.
    fn run(&mut self, params: SearchParams) -> Result<Outcome, ChainError> {
        self.run_with(params, params)
    }

    /// Every agency's keys, Leader first.
    fn agencies(&self) -> Vec<&KeyStore> {
        std::iter::once(&self.leader).chain(self.oversight.iter().map(|(_, keys)| keys)).collect()
    }

    fn run_with(
        &mut self,
        leader_params: SearchParams,
        oversight_params: SearchParams,
    ) -> Result<Outcome, ChainError> {
        let mut leader = ChainState::new(Role::Leader, leader_params, TOPOLOGY);
        let mut replicas: Vec<ChainState> = self
            .oversight
            .iter()
            .map(|(id, _)| ChainState::new(Role::Oversight(*id), oversight_params, TOPOLOGY))
            .collect();

        let initial = leader.begin(&self.leader, &mut self.rng)?;
        leader.sign_own(&self.leader)?;
        let signed = leader.pending()[&initial.telecom].clone();
        for (replica, (id, keys)) in replicas.iter_mut().zip(&self.oversight) {
            replica.accept_initial(&signed, keys)?;
            leader.attach_signatures(*id, &replica.sign_pending(keys)?, &self.leader)?;
        }

        let mut query_types = vec![initial.query_type];
        let mut responses = self.dispatch(&leader);
        let mut summaries = vec![leader.absorb(&responses, &self.leader)?];

        loop {
            let batches = leader.next_batches()?;
            if batches.is_empty() {
                break;
            }
            query_types.push(batches[0].query_type);
            leader.sign_own(&self.leader)?;

            for (replica, (id, keys)) in replicas.iter_mut().zip(&self.oversight) {
                replica.absorb(&responses, keys)?;
                assert_eq!(replica.distance(), leader.distance());
                replica.next_batches()?;
                leader.attach_signatures(*id, &replica.sign_pending(keys)?, &self.leader)?;
            }

            responses = self.dispatch(&leader);
            summaries.push(leader.absorb(&responses, &self.leader)?);
        }

        for (replica, (_, keys)) in replicas.iter_mut().zip(&self.oversight) {
            replica.absorb(&responses, keys)?;
            assert!(replica.is_complete());
            assert_eq!(replica.outputs(), leader.outputs());
        }
        assert!(leader.is_complete());

        let agencies = self.agencies();
        let users = leader.outputs().iter().map(|ct| disclose(&agencies, ct).unwrap()).collect();

        Ok(Outcome { users, summaries, query_types })
    }
}

fn small_graph() -> BTreeMap<UserId, Vec<UserId>> {
    BTreeMap::from([(1, vec![2, 3]), (2, vec![1]), (3, vec![1])])
}

/// Plaintext BFS under the same admission rule.
fn oracle(graph: &BTreeMap<UserId, Vec<UserId>>, params: SearchParams) -> BTreeSet<UserId> {
    let mut found = BTreeSet::from([params.target]);
    let mut level = vec![params.target];
    for distance in 0..params.max_distance {
        let mut next = Vec::new();
        for user in &level {
            let neighbors = &graph[user];
            if distance > 0 && neighbors.len() > params.max_degree as usize {
                continue;
            }
            for &n in neighbors {
                if graph.contains_key(&n) && found.insert(n) {
                    next.push(n);
                }
            }
        }
        level = next;
    }
    found
}

#[test]
fn distance_one_finds_target_and_neighbors() {
    let mut world = World::new(&small_graph(), 1);
    let outcome = world.run(SearchParams { target: 1, max_distance: 1, max_degree: 10 }).unwrap();

    assert_eq!(outcome.users, BTreeSet::from([1, 2, 3]));
    assert_eq!(outcome.query_types, vec![QueryType::Search, QueryType::Conclude]);
}

#[test]
fn target_degree_is_exempt_from_max_degree() {
    let mut world = World::new(&small_graph(), 2);
    let outcome = world.run(SearchParams { target: 1, max_distance: 1, max_degree: 1 }).unwrap();

    assert_eq!(outcome.users, BTreeSet::from([1, 2, 3]));
    assert_eq!(outcome.summaries[0].admitted, 2);
}

#[test]
fn converging_paths_disclose_once() {
    let graph = BTreeMap::from([(1, vec![2, 3]), (2, vec![1, 3]), (3, vec![1, 2])]);
    let mut world = World::new(&graph, 3);
    let outcome = world.run(SearchParams { target: 1, max_distance: 2, max_degree: 10 }).unwrap();

    assert_eq!(outcome.users, BTreeSet::from([1, 2, 3]));
    let last = outcome.summaries.last().unwrap();
    assert_eq!(last.found, 0);
    assert_eq!(last.already_sent, 4);
}

#[test]
fn max_distance_zero_concludes_immediately() {
    let mut world = World::new(&small_graph(), 4);
    let outcome = world.run(SearchParams { target: 1, max_distance: 0, max_degree: 10 }).unwrap();

    assert_eq!(outcome.users, BTreeSet::from([1]));
    assert_eq!(outcome.query_types, vec![QueryType::Conclude]);
    assert_eq!(outcome.summaries.len(), 1);
}

#[test]
fn high_degree_node_is_not_expanded() {
    let graph = BTreeMap::from([
        (1, vec![2]),
        (2, vec![1, 3, 4, 5]),
        (3, vec![6]),
        (4, vec![]),
        (5, vec![]),
        (6, vec![]),
    ]);
    let mut world = World::new(&graph, 5);
    let outcome = world.run(SearchParams { target: 1, max_distance: 3, max_degree: 2 }).unwrap();

    assert_eq!(outcome.users, BTreeSet::from([1, 2]));
}

#[test]
fn missing_target_aborts() {
    let mut world = World::new(&small_graph(), 6);
    let err = world.run(SearchParams { target: 40, max_distance: 1, max_degree: 10 }).unwrap_err();
    assert!(matches!(err, ChainError::Protocol { .. }));
}

#[test]
fn divergent_oversight_parameters_are_caught() {
    let mut world = World::new(&small_graph(), 7);
    let leader = SearchParams { target: 1, max_distance: 2, max_degree: 10 };
    let oversight = SearchParams { max_distance: 1, ..leader };

    // Oversight expects a conclude query at distance 1 and signs that instead
    let err = world.run_with(leader, oversight).unwrap_err();
    assert!(matches!(err, ChainError::Signature { signer: PartyId::Agency(_), .. }));
}

#[test]
fn oversight_rejects_misaddressed_initial_query() {
    let mut world = World::new(&small_graph(), 8);
    let params = SearchParams { target: 1, max_distance: 1, max_degree: 10 };

    let token = world.leader.encrypt_for_telecom(TelecomId(0), 1, &mut world.rng).unwrap();
    let mut batch = BatchQuery::new(TelecomId(0), QueryType::Search, vec![token]);
    batch.add_signature(AgencyId::LEADER, world.leader.sign(&batch.signing_payload().unwrap()));

    let (id, keys) = &world.oversight[0];
    let mut replica = ChainState::new(Role::Oversight(*id), params, TOPOLOGY);
    assert!(matches!(replica.accept_initial(&batch, keys), Err(ChainError::Audit { .. })));
}

#[test]
fn oversight_rejects_unsigned_initial_query() {
    let mut world = World::new(&small_graph(), 9);
    let params = SearchParams { target: 1, max_distance: 1, max_degree: 10 };

    let token = world.leader.encrypt_for_telecom(TelecomId(1), 1, &mut world.rng).unwrap();
    let batch = BatchQuery::new(TelecomId(1), QueryType::Search, vec![token]);

    let (id, keys) = &world.oversight[0];
    let mut replica = ChainState::new(Role::Oversight(*id), params, TOPOLOGY);
    assert!(matches!(
        replica.accept_initial(&batch, keys),
        Err(ChainError::Signature { signer: PartyId::Agency(AgencyId(0)), .. })
    ));
}

#[test]
fn telecom_refuses_batch_missing_a_signature() {
    let mut world = World::new(&small_graph(), 10);
    let params = SearchParams { target: 1, max_distance: 1, max_degree: 10 };

    let mut leader = ChainState::new(Role::Leader, params, TOPOLOGY);
    leader.begin(&world.leader, &mut world.rng).unwrap();
    leader.sign_own(&world.leader).unwrap();

    let responses = world.dispatch(&leader);
    assert_eq!(responses[0].responses, vec![TokenResponse::InvalidSignature]);
    assert_eq!(world.sessions[1].sent_count(), 0);

    let err = leader.absorb(&responses, &world.leader).unwrap_err();
    assert!(matches!(err, ChainError::RejectedByTelecom { telecom: TelecomId(1) }));
}

#[test]
fn forged_response_signature_is_rejected() {
    let mut world = World::new(&small_graph(), 11);
    let params = SearchParams { target: 1, max_distance: 1, max_degree: 10 };

    let mut leader = ChainState::new(Role::Leader, params, TOPOLOGY);
    leader.begin(&world.leader, &mut world.rng).unwrap();
    leader.sign_own(&world.leader).unwrap();
    for (id, keys) in &world.oversight {
        let sigs = leader.sign_pending(keys).unwrap();
        leader.attach_signatures(*id, &sigs, &world.leader).unwrap();
    }

    let mut responses = world.dispatch(&leader);
    responses[0].responses.push(TokenResponse::NotFound);

    let err = leader.absorb(&responses, &world.leader).unwrap_err();
    assert!(matches!(err, ChainError::Signature { signer: PartyId::Telecom(TelecomId(1)), .. }));
}

#[test]
fn workers_preserve_token_order_and_dedup() {
    let graph: BTreeMap<UserId, Vec<UserId>> = (0..80).map(|u| (u, vec![(u + 2) % 80])).collect();
    let mut world = World::new(&graph, 12);

    let users: Vec<UserId> =
        (0..80).filter(|u| owner_of(*u, 2) == Some(TelecomId(0))).take(35).collect();
    let tokens = users
        .iter()
        .map(|&u| world.leader.encrypt_for_telecom(TelecomId(0), u, &mut world.rng).unwrap())
        .collect();
    let mut batch = BatchQuery::new(TelecomId(0), QueryType::Conclude, tokens);
    let payload = batch.signing_payload().unwrap();
    batch.add_signature(AgencyId::LEADER, world.leader.sign(&payload));
    for (id, keys) in &world.oversight {
        batch.add_signature(*id, keys.sign(&payload));
    }

    assert_eq!(world.responders[0].worker_count(batch.len()), 4);

    let first =
        world.responders[0].respond(&mut world.sessions[0], &batch, &mut world.rng).unwrap();
    let agencies = world.agencies();
    let disclosed: Vec<UserId> = first
        .responses
        .iter()
        .map(|r| match r {
            TokenResponse::Data { agency_ciphertext, neighbors } => {
                assert!(neighbors.is_empty());
                disclose(&agencies, agency_ciphertext).unwrap()
            },
            other => panic!("unexpected response {other:?}"),
        })
        .collect();
    assert_eq!(disclosed, users);

    let second =
        world.responders[0].respond(&mut world.sessions[0], &batch, &mut world.rng).unwrap();
    assert!(second.responses.iter().all(|r| *r == TokenResponse::AlreadySent));
}

#[test]
fn new_session_forgets_sent_users() {
    let mut world = World::new(&small_graph(), 13);
    let params = SearchParams { target: 1, max_distance: 0, max_degree: 10 };

    world.run(params).unwrap();
    world.sessions = TOPOLOGY.telecom_ids().map(|_| Session::new()).collect();
    let outcome = world.run(params).unwrap();

    assert_eq!(outcome.users, BTreeSet::from([1]));
}

#[test]
fn prop_disclosed_set_matches_plaintext_bfs() {
    proptest!(ProptestConfig::with_cases(12), |(
        edges in prop::collection::vec((0u64..12, 0u64..12), 0..30),
        target in 0u64..12,
        max_distance in 0u32..4,
        max_degree in 1u32..5,
        seed in any::<u64>(),
    )| {
        let mut adjacency: HashMap<UserId, BTreeSet<UserId>> =
            (0..12).map(|u| (u, BTreeSet::new())).collect();
        for (a, b) in edges {
            if a != b {
                adjacency.get_mut(&a).unwrap().insert(b);
            }
        }
        let graph: BTreeMap<UserId, Vec<UserId>> =
            adjacency.into_iter().map(|(u, n)| (u, n.into_iter().collect())).collect();
        let params = SearchParams { target, max_distance, max_degree };

        let mut world = World::new(&graph, seed);
        let outcome = world.run(params).unwrap();

        // PROPERTY: the agencies jointly disclose exactly the admitted BFS ball
        prop_assert_eq!(outcome.users, oracle(&graph, params));
    });
}
