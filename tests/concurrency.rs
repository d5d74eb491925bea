//! Concurrent registrations against one service.

mod common;

use std::collections::HashSet;
use std::thread;

use common::*;
use proclineage::error::ReasonCode;
use proclineage::hierarchy::ResourceLimits;
use proclineage::provenance::ProvenanceStore;
use proclineage::{ProcessId, ProcessIdentity, Registrar};

const SIBLINGS: usize = 24;

#[test]
fn concurrent_siblings_are_all_recorded() {
    let service = service();
    let root = root_identity();
    service.register_entry(&root_request(&root)).unwrap();
    let worker = spawn_registered(&service, &root, WORKER);

    let children: Vec<ProcessIdentity> = (0..SIBLINGS)
        .map(|i| {
            let script = if i % 3 == 0 { VALIDATOR } else { WORKER };
            spawn_identity(&worker, script).1
        })
        .collect();

    thread::scope(|s| {
        for child in &children {
            let service = &service;
            s.spawn(move || {
                let response = service.register(&child.registration_request());
                assert!(response.registered, "{:?}", response.error);
            });
        }
    });

    let entry = service.store().get(worker.process_id()).unwrap();
    assert_eq!(entry.children.len(), SIBLINGS);
    let listed: HashSet<&ProcessId> = entry.children.iter().collect();
    for child in &children {
        assert!(listed.contains(child.process_id()));
    }

    // every sequence number is distinct
    let sequences: HashSet<u64> = service.store().snapshot().iter().map(|e| e.sequence).collect();
    assert_eq!(sequences.len(), SIBLINGS + 2);
}

#[test]
fn racing_duplicates_admit_exactly_one() {
    let service = service();
    let root = root_identity();
    service.register_entry(&root_request(&root)).unwrap();
    let (_, worker) = spawn_identity(&root, WORKER);
    let request = worker.registration_request();

    let responses: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = &service;
                let request = &request;
                s.spawn(move || service.register(request))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let accepted = responses.iter().filter(|r| r.registered).count();
    assert_eq!(accepted, 1);
    assert!(responses
        .iter()
        .filter(|r| !r.registered)
        .all(|r| r.error == Some(ReasonCode::DuplicateRegistration)));

    let root_entry = service.store().get(&ProcessId::new("root")).unwrap();
    assert_eq!(root_entry.children, vec![worker.process_id().clone()]);
    assert_eq!(service.store().rejections().len(), 7);
}

#[test]
fn concurrent_subtrees_under_different_parents() {
    let service = service();
    let root = root_identity();
    service.register_entry(&root_request(&root)).unwrap();
    let parents: Vec<ProcessIdentity> = (0..4)
        .map(|_| spawn_registered(&service, &root, WORKER))
        .collect();

    thread::scope(|s| {
        for parent in &parents {
            let service = &service;
            s.spawn(move || {
                for _ in 0..5 {
                    let (_, child) = spawn_identity(parent, WORKER);
                    assert!(service.register(&child.registration_request()).registered);
                }
            });
        }
    });

    let tree = service.subtree(&ProcessId::new("root")).unwrap();
    assert_eq!(tree.ids().len(), 1 + 4 + 4 * 5);
    for parent in &parents {
        assert_eq!(service.store().get(parent.process_id()).unwrap().children.len(), 5);
    }
}

#[test]
fn racing_siblings_respect_max_children() {
    let limits = ResourceLimits {
        max_children: 1,
        ..ResourceLimits::default()
    };
    for _ in 0..20 {
        let service = service_with(ProvenanceStore::new(), limits);
        let root = root_identity();
        service.register_entry(&root_request(&root)).unwrap();
        let siblings: Vec<ProcessIdentity> = (0..16).map(|_| spawn_identity(&root, WORKER).1).collect();

        let responses: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = siblings
                .iter()
                .map(|child| {
                    let service = &service;
                    s.spawn(move || service.register(&child.registration_request()))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(responses.iter().filter(|r| r.registered).count(), 1);
        assert!(responses
            .iter()
            .filter(|r| !r.registered)
            .all(|r| r.error == Some(ReasonCode::LimitExceeded)));
        assert_eq!(service.store().get(&ProcessId::new("root")).unwrap().children.len(), 1);
        assert_eq!(service.tracker().live_count(), 2);
    }
}

#[test]
fn racing_siblings_respect_max_live() {
    let limits = ResourceLimits {
        max_live: 4,
        ..ResourceLimits::default()
    };
    let service = service_with(ProvenanceStore::new(), limits);
    let root = root_identity();
    service.register_entry(&root_request(&root)).unwrap();
    let siblings: Vec<ProcessIdentity> = (0..12).map(|_| spawn_identity(&root, WORKER).1).collect();

    thread::scope(|s| {
        for child in &siblings {
            let service = &service;
            s.spawn(move || service.register(&child.registration_request()));
        }
    });
    assert_eq!(service.tracker().live_count(), 4);
    assert_eq!(service.store().len(), 4);
}
