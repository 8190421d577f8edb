//! Property-based tests for the Tasuki runtime.
//!
//! Uses proptest to drive random lock/unlock histories through the fast
//! paths and verify the lock word stays consistent with a simple model.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use proptest::prelude::*;
use tasuki_runtime::lockword::bits::{INC, MAX_RECURSION, RESERVED};
use tasuki_runtime::lower::lower;
use tasuki_runtime::{
    ClassMetadata, CompiledLockSite, FastPathPlan, HelperKind, LockSiteProfile, LockWord, LockWordLocation,
    Machine, MonitorConfig, MonitorError, MonitorSystem, ObjectRef, Outcome, Protocol, ThreadContext,
    ThreadRegistry,
};

/// Strategy for the non-primitive inline protocols
fn inline_protocol() -> impl Strategy<Value = Protocol> {
    prop_oneof![
        Just(Protocol::Counting),
        Just(Protocol::Reservation { primitive: false }),
    ]
}

/// Strategy for any inline protocol
fn any_protocol() -> impl Strategy<Value = Protocol> {
    prop_oneof![
        Just(Protocol::Counting),
        Just(Protocol::Reservation { primitive: false }),
        Just(Protocol::Reservation { primitive: true }),
    ]
}

/// One step of a lock history: (object, site, enter?)
fn history() -> impl Strategy<Value = Vec<(usize, usize, bool)>> {
    prop::collection::vec((0usize..3, 0usize..2, any::<bool>()), 0..120)
}

fn embedded_site(class: &ClassMetadata, protocol: Protocol) -> CompiledLockSite {
    let plan = FastPathPlan::Inline {
        location: LockWordLocation::Embedded(class.lock_word_offset().unwrap()),
        guard: false,
        protocol,
    };
    lower(class.id(), plan).unwrap()
}

fn system(reservation: bool) -> MonitorSystem {
    let config = MonitorConfig::builder().lock_reservation(reservation).build().unwrap();
    MonitorSystem::new(config).unwrap()
}

proptest! {
    /// Balanced enter/exit through one site leaves the monitor unheld
    #[test]
    fn recursion_balance(depth in 1usize..40, reservation in any::<bool>(), embedded in any::<bool>()) {
        let system = system(reservation);
        let thread = system.attach_thread();
        let class = ClassMetadata::builder("Balanced").embedded_lock_word(embedded).build();
        let site = system.compile_site(&class, &LockSiteProfile::default()).unwrap();
        let obj = ObjectRef::allocate(&class);

        for n in 1..=depth {
            system.monitor_enter(&thread, &site, &obj).unwrap();
            let word = system.lock_word(&obj);
            prop_assert!(word.is_owned_by(thread.identity()));
            prop_assert_eq!(word.recursion() + system.overflow_depth(&obj), n);
        }
        for _ in 0..depth {
            system.monitor_exit(&thread, &site, &obj).unwrap();
        }

        let word = system.lock_word(&obj);
        prop_assert!(!word.is_held());
        prop_assert_eq!(system.overflow_depth(&obj), 0);
        let is_illegal = matches!(
            system.monitor_exit(&thread, &site, &obj),
            Err(MonitorError::IllegalMonitorState { .. })
        );
        prop_assert!(is_illegal);
    }

    /// Random nested histories over mixed sites match a per-object depth model
    #[test]
    fn mixed_sites_match_model(steps in history()) {
        let system = system(true);
        let thread = system.attach_thread();
        let classes = [
            ClassMetadata::builder("Embedded").build(),
            ClassMetadata::builder("Bare").embedded_lock_word(false).build(),
        ];
        let objects: Vec<ObjectRef> = (0..3).map(|i| ObjectRef::allocate(&classes[i % 2])).collect();
        let sites: Vec<[CompiledLockSite; 2]> = classes
            .iter()
            .map(|class| {
                [
                    system.compile_site(class, &LockSiteProfile::default()).unwrap(),
                    system.compile_site(class, &LockSiteProfile::default().reservation(false)).unwrap(),
                ]
            })
            .collect();
        let mut depth: HashMap<usize, usize> = HashMap::new();

        for (index, site_index, enter) in steps {
            let obj = &objects[index];
            let site = &sites[index % 2][site_index];
            let d = depth.entry(index).or_insert(0);

            if enter {
                system.monitor_enter(&thread, site, obj).unwrap();
                *d += 1;
            } else if *d == 0 {
                prop_assert!(system.monitor_exit(&thread, site, obj).is_err());
            } else {
                system.monitor_exit(&thread, site, obj).unwrap();
                *d -= 1;
            }

            let word = system.lock_word(obj);
            prop_assert_eq!(word.is_held(), *d > 0);
            prop_assert_eq!(word.recursion() + system.overflow_depth(obj), *d);
            prop_assert!(!thread.holds_lease());
        }
    }

    /// Two racing enter sequences never both acquire a free word
    #[test]
    fn racing_enters_are_exclusive(
        pa in inline_protocol(),
        pb in inline_protocol(),
        schedule in prop::collection::vec(any::<bool>(), 0..64),
    ) {
        let registry = Arc::new(ThreadRegistry::new());
        let class = ClassMetadata::builder("Raced").build();
        let obj = ObjectRef::allocate(&class);
        let a = ThreadContext::attach(&registry, 32);
        let b = ThreadContext::attach(&registry, 32);
        let site_a = embedded_site(&class, pa);
        let site_b = embedded_site(&class, pb);

        let mut ma = Machine::new(site_a.enter(), &a, &obj);
        let mut mb = Machine::new(site_b.enter(), &b, &obj);
        for pick_a in schedule {
            let m = if pick_a { &mut ma } else { &mut mb };
            if m.outcome().is_none() {
                m.step().unwrap();
            }
        }
        let ra = ma.run().unwrap();
        let rb = mb.run().unwrap();

        let word = obj.lock_word().unwrap();
        match (ra, rb) {
            (Outcome::Done, Outcome::CallHelper(HelperKind::MonitorEnter)) => {
                prop_assert!(word.is_owned_by(a.identity()));
            }
            (Outcome::CallHelper(HelperKind::MonitorEnter), Outcome::Done) => {
                prop_assert!(word.is_owned_by(b.identity()));
            }
            other => prop_assert!(false, "unexpected outcomes {:?}", other),
        }
        prop_assert_eq!(word.recursion(), 1);
    }

    /// A word reserved to another thread is never written by the fast path
    #[test]
    fn reservation_never_weakens_exclusion(recursion in 0usize..=MAX_RECURSION, protocol in any_protocol()) {
        let registry = Arc::new(ThreadRegistry::new());
        let class = ClassMetadata::builder("Reserved").build();
        let obj = ObjectRef::allocate(&class);
        let owner = ThreadContext::attach(&registry, 32);
        let other = ThreadContext::attach(&registry, 32);
        let site = embedded_site(&class, protocol);

        let reserved = owner.identity().as_usize() | RESERVED | recursion * INC;
        obj.embedded_lock_word().unwrap().store(reserved, Ordering::Relaxed);

        for (seq, kind) in [(site.enter(), HelperKind::MonitorEnter), (site.exit(), HelperKind::MonitorExit)] {
            let mut m = Machine::new(seq, &other, &obj);
            prop_assert_eq!(m.run(), Ok(Outcome::CallHelper(kind)));
            prop_assert_eq!(m.stats().plain_stores, 0);
            prop_assert_eq!(obj.lock_word().unwrap().raw(), reserved);
        }
    }

    /// Once reserved, re-entry by the owner performs no atomic operation
    #[test]
    fn reserved_reentry_is_atomic_free(rounds in 1usize..50, primitive in any::<bool>()) {
        let system = system(true);
        let thread = system.attach_thread();
        let class = ClassMetadata::builder("Hot").build();
        let site = system.compile_site(&class, &LockSiteProfile::default().primitive(primitive)).unwrap();
        let obj = ObjectRef::allocate(&class);

        system.monitor_enter(&thread, &site, &obj).unwrap();
        system.monitor_exit(&thread, &site, &obj).unwrap();
        prop_assert_eq!(system.lock_word(&obj), LockWord::reserved_for(thread.identity()));

        thread.reset_stats();
        for _ in 0..rounds {
            system.monitor_enter(&thread, &site, &obj).unwrap();
            system.monitor_exit(&thread, &site, &obj).unwrap();
        }
        prop_assert_eq!(thread.stats().atomic_ops(), 0);
        prop_assert_eq!(thread.stats().helper_calls, 0);
        prop_assert_eq!(system.lock_word(&obj), LockWord::reserved_for(thread.identity()));
    }
}

#[test]
fn overflow_beyond_word_capacity() {
    let system = system(false);
    let thread = system.attach_thread();
    let class = ClassMetadata::builder("Deep").build();
    let site = system.compile_site(&class, &LockSiteProfile::default()).unwrap();
    let obj = ObjectRef::allocate(&class);
    let holds = 3 * MAX_RECURSION;

    for _ in 0..holds {
        system.monitor_enter(&thread, &site, &obj).unwrap();
    }
    let word = system.lock_word(&obj);
    assert!(word.has_flc());
    assert_eq!(word.recursion(), MAX_RECURSION);
    assert_eq!(system.overflow_depth(&obj), holds - MAX_RECURSION);

    for _ in 0..holds {
        system.monitor_exit(&thread, &site, &obj).unwrap();
    }
    assert_eq!(system.lock_word(&obj), LockWord::UNLOCKED);
    assert_eq!(system.runtime_stats().unwrap().overflows, 1);
}
