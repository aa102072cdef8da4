use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier, Mutex,
    },
    thread,
};

use proptest::prelude::*;
use rstest::{fixture, rstest};

use crate::*;

#[fixture]
fn cache() -> Arc<DataCache> { DataCache::new(CacheConfig::default()) }

fn replacing() -> Arc<DataCache>
{
    DataCache::new(CacheConfig::default().with_insert_policy(InsertPolicy::Replace))
}

struct Scene
{
    context: Strong<()>,
    input: Strong<&'static str>,
    data_key: Key,
    observer_key: Key,
}

#[fixture]
fn scene() -> Scene
{
    let context = Strong::new(());
    let input = Strong::new("O");
    let data_key = key!["alpha", 10, &input];
    let observer_key = key!["alpha", 10, &input, &context];
    Scene {
        context,
        input,
        data_key,
        observer_key,
    }
}

fn payload() -> Strong<Vec<i32>> { Strong::new(vec![1, 2, 3]) }

#[rstest]
fn user_story(cache: Arc<DataCache>, scene: Scene)
{
    assert_eq!(scene.context.mtime(), 0);
    assert_eq!(scene.input.mtime(), 0);
    assert!(cache.lookup::<Vec<i32>>(&scene.data_key).is_none());

    let p = payload();
    let res = cache.insert(
        &scene.context,
        p.clone(),
        scene.data_key.clone(),
        scene.observer_key.clone(),
    );
    assert_eq!(res, Ok(Insertion::Inserted));

    let hit = cache.lookup::<Vec<i32>>(&scene.data_key).unwrap();
    assert!(Strong::ptr_eq(&hit, &p));
    assert_eq!(*hit, vec![1, 2, 3]);
    assert_eq!(cache.len(), 1);
}

#[rstest]
fn keys_from_same_components_are_equal(scene: Scene)
{
    let again = key!["alpha", 10, &scene.input];
    assert_eq!(scene.data_key, again);
    assert_eq!(scene.data_key.hash_value(), again.hash_value());
}

#[rstest]
#[case(key!["alpha", 10], key!["alpha", 11])]
#[case(key!["alpha", 10], key![10, "alpha"])]
#[case(key!["alpha", 10], key!["alpha", 10u64])]
#[case(key!["alpha"], key!["alpha", key![]])]
#[case(key![key!["a"], "b"], key![key!["a", "b"]])]
fn keys_with_different_components_differ(#[case] a: Key, #[case] b: Key)
{
    assert_ne!(a, b);
}

#[rstest]
fn dependency_modification_evicts(cache: Arc<DataCache>, scene: Scene)
{
    cache
        .insert(&scene.context, payload(), scene.data_key.clone(), scene.observer_key.clone())
        .unwrap();
    assert_eq!(cache.len(), 1);

    scene.input.modified();

    assert_eq!(cache.len(), 0);
    let rebuilt = key!["alpha", 10, &scene.input];
    assert_ne!(rebuilt, scene.data_key);
    assert!(cache.lookup::<Vec<i32>>(&scene.data_key).is_none());
    assert!(cache.lookup::<Vec<i32>>(&rebuilt).is_none());
}

#[rstest]
fn context_modification_evicts(cache: Arc<DataCache>, scene: Scene)
{
    cache
        .insert(&scene.context, payload(), scene.data_key.clone(), scene.observer_key.clone())
        .unwrap();

    scene.context.modified();

    assert_eq!(cache.len(), 0);
    assert_eq!(cache.stats().watched_objects, 0);
}

#[rstest]
fn context_without_dependencies(cache: Arc<DataCache>)
{
    let context = Strong::new(0u32);
    let data_key = key!["tag"];
    cache
        .insert(&context, payload(), data_key.clone(), key!["tag", &context])
        .unwrap();

    let unrelated = Strong::new(0u32);
    unrelated.modified();
    assert!(cache.contains(&data_key));

    context.modified();
    assert!(!cache.contains(&data_key));
}

#[rstest]
fn self_dependency_evicts_once(cache: Arc<DataCache>)
{
    let context = Strong::new(());
    let data_key = key!["self", &context];
    cache
        .insert(&context, payload(), data_key.clone(), key!["self", &context, &context])
        .unwrap();
    assert_eq!(context.observer_count(), 1);

    let before = cache.stats().evictions;
    context.modified();
    assert_eq!(cache.stats().evictions - before, 1);
    assert_eq!(context.observer_count(), 0);
}

#[rstest]
fn modification_evicts_every_dependent_entry(cache: Arc<DataCache>)
{
    let context = Strong::new(());
    let shared = Strong::new(());
    let other = Strong::new(());
    for i in 0..3 {
        cache
            .insert(&context, payload(), key![i, &shared], key![i, &shared, &context])
            .unwrap();
    }
    cache
        .insert(&context, payload(), key![9, &other], key![9, &other, &context])
        .unwrap();
    assert_eq!(cache.len(), 4);

    shared.modified();
    assert_eq!(cache.len(), 1);
    assert!(cache.contains(&key![9, &other]));
}

#[rstest]
fn equal_keys_insert_once(cache: Arc<DataCache>, scene: Scene)
{
    let first = payload();
    cache
        .insert(&scene.context, first.clone(), scene.data_key.clone(), scene.observer_key.clone())
        .unwrap();
    let res = cache.insert(
        &scene.context,
        payload(),
        scene.data_key.clone(),
        scene.observer_key.clone(),
    );

    assert_eq!(res, Ok(Insertion::Kept));
    assert_eq!(cache.len(), 1);
    assert_eq!(scene.input.observer_count(), 1);
    let hit = cache.lookup::<Vec<i32>>(&scene.data_key).unwrap();
    assert!(Strong::ptr_eq(&hit, &first));
}

#[rstest]
fn replace_policy_swaps_payload(scene: Scene)
{
    let cache = replacing();
    cache
        .insert(&scene.context, payload(), scene.data_key.clone(), scene.observer_key.clone())
        .unwrap();
    let second = payload();
    let res = cache.insert(
        &scene.context,
        second.clone(),
        scene.data_key.clone(),
        scene.observer_key.clone(),
    );

    assert_eq!(res, Ok(Insertion::Replaced));
    assert_eq!(cache.len(), 1);
    assert_eq!(scene.input.observer_count(), 1);
    let hit = cache.lookup::<Vec<i32>>(&scene.data_key).unwrap();
    assert!(Strong::ptr_eq(&hit, &second));
}

#[rstest]
fn observer_key_collision_evicts_previous_entry(cache: Arc<DataCache>)
{
    let context = Strong::new(());
    let observer_key = key!["shared", &context];
    cache
        .insert(&context, payload(), key!["one"], observer_key.clone())
        .unwrap();
    cache
        .insert(&context, payload(), key!["two"], observer_key)
        .unwrap();

    assert!(!cache.contains(&key!["one"]));
    assert!(cache.contains(&key!["two"]));
    let stats = cache.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.observers, 1);
    assert_eq!(context.observer_count(), 1);
}

#[rstest]
fn stale_key_is_rejected(cache: Arc<DataCache>, scene: Scene)
{
    scene.input.modified();
    let res = cache.insert(
        &scene.context,
        payload(),
        scene.data_key.clone(),
        scene.observer_key.clone(),
    );

    assert_eq!(
        res,
        Err(CacheError::StaleKey {
            object: scene.input.id(),
            captured: 0,
            current: 1,
        })
    );
    assert!(cache.is_empty());
    assert_eq!(scene.input.observer_count(), 0);
    assert_eq!(scene.context.observer_count(), 0);
    assert_eq!(cache.stats().rejected, 1);
}

#[rstest]
fn stale_key_accepted_without_validation(scene: Scene)
{
    let cache = DataCache::new(CacheConfig::default().with_validate_mtimes(false));
    scene.input.modified();
    let res = cache.insert(
        &scene.context,
        payload(),
        scene.data_key.clone(),
        scene.observer_key.clone(),
    );
    assert_eq!(res, Ok(Insertion::Inserted));
}

#[rstest]
fn expired_dependency_is_rejected(cache: Arc<DataCache>)
{
    let context = Strong::new(());
    let gone = Strong::new(());
    let id = gone.id();
    let data_key = key!["gone", &gone];
    drop(gone);

    let res = cache.insert(&context, payload(), data_key.clone(), key![&context]);
    assert_eq!(res, Err(CacheError::Expired(id)));
    assert!(cache.lookup_any(&data_key).is_none());
    assert_eq!(context.observer_count(), 0);
}

#[rstest]
fn type_mismatch_is_a_miss_without_eviction(cache: Arc<DataCache>, scene: Scene)
{
    cache
        .insert(&scene.context, payload(), scene.data_key.clone(), scene.observer_key.clone())
        .unwrap();

    assert!(cache.lookup::<String>(&scene.data_key).is_none());
    assert!(cache.lookup::<Vec<i32>>(&scene.data_key).is_some());
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
    assert_eq!(stats.hit_ratio(), Some(0.5));
}

#[rstest]
fn evict_is_idempotent(cache: Arc<DataCache>, scene: Scene)
{
    cache
        .insert(&scene.context, payload(), scene.data_key.clone(), scene.observer_key.clone())
        .unwrap();

    assert!(cache.evict(&scene.data_key, &scene.observer_key));
    assert!(!cache.evict(&scene.data_key, &scene.observer_key));
    assert!(!cache.remove(&scene.data_key));
    assert_eq!(scene.input.observer_count(), 0);
    assert_eq!(scene.context.observer_count(), 0);
}

#[rstest]
fn evict_watching_walks_the_index(cache: Arc<DataCache>, scene: Scene)
{
    cache
        .insert(&scene.context, payload(), scene.data_key.clone(), scene.observer_key.clone())
        .unwrap();
    assert_eq!(cache.evict_watching(Strong::new(()).id()), 0);
    assert_eq!(cache.evict_watching(scene.input.id()), 1);
    assert!(cache.is_empty());
}

#[rstest]
fn evict_watching_counts_every_entry(cache: Arc<DataCache>)
{
    let context = Strong::new(());
    let shared = Strong::new(());
    for i in 0..3 {
        cache
            .insert(&context, payload(), key![i, &shared], key![i, &shared, &context])
            .unwrap();
    }

    assert_eq!(cache.evict_watching(shared.id()), 3);
    assert_eq!(cache.stats().evictions, 3);
    assert_eq!(context.observer_count(), 0);
    assert_eq!(shared.observer_count(), 0);
}

#[rstest]
fn late_notification_spares_a_reinserted_entry(cache: Arc<DataCache>)
{
    let input = Strong::new(());
    let first = Strong::new(());
    let second = Strong::new(());
    let data_key = key!["tag", &input];

    // Subscribed ahead of the cache: moves the entry over to `second` while
    // `first` is still notifying.
    {
        let cache = Arc::downgrade(&cache);
        let data_key = data_key.clone();
        let observer_key = key!["tag", &input, &second];
        let second = second.clone();
        first.add_observer(move |_: &ModifiedEvent| {
            if let Some(cache) = cache.upgrade() {
                cache.remove(&data_key);
                let payload = Strong::new(2u8);
                let res = cache.insert(&second, payload, data_key.clone(), observer_key.clone());
                assert_eq!(res, Ok(Insertion::Inserted));
            }
        });
    }
    cache
        .insert(&first, Strong::new(1u8), data_key.clone(), key!["tag", &input, &first])
        .unwrap();

    first.modified();
    assert_eq!(cache.lookup::<u8>(&data_key).as_deref(), Some(&2));
    assert_eq!(second.observer_count(), 1);

    second.modified();
    assert!(cache.lookup::<u8>(&data_key).is_none());
}

#[rstest]
fn payload_lives_as_long_as_the_entry(cache: Arc<DataCache>, scene: Scene)
{
    let p = payload();
    let w = p.weak();
    cache
        .insert(&scene.context, p, scene.data_key.clone(), scene.observer_key.clone())
        .unwrap();
    assert!(!w.expired());

    scene.context.modified();
    assert!(w.expired());
}

#[rstest]
fn observers_do_not_keep_objects_alive(cache: Arc<DataCache>, scene: Scene)
{
    let Scene {
        context,
        input,
        data_key,
        observer_key,
    } = scene;
    cache.insert(&context, payload(), data_key, observer_key).unwrap();
    let w = input.weak();
    assert_eq!(input.strong_count(), 1);

    drop(input);
    assert!(w.expired());
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.purge_expired(), 1);
    assert!(cache.is_empty());
    assert_eq!(context.observer_count(), 0);
}

#[rstest]
fn dropping_the_cache_unsubscribes(scene: Scene)
{
    let cache = DataCache::new(CacheConfig::default());
    cache
        .insert(&scene.context, payload(), scene.data_key.clone(), scene.observer_key.clone())
        .unwrap();
    assert_eq!(scene.context.observer_count(), 1);

    drop(cache);
    assert_eq!(scene.context.observer_count(), 0);
    scene.context.modified();
}

#[rstest]
fn clear_empties_every_index(cache: Arc<DataCache>, scene: Scene)
{
    cache
        .insert(&scene.context, payload(), scene.data_key.clone(), scene.observer_key.clone())
        .unwrap();
    assert_eq!(cache.clear(), 1);

    let stats = cache.stats();
    assert_eq!((stats.entries, stats.observers, stats.watched_objects), (0, 0, 0));
    assert_eq!(scene.input.observer_count(), 0);
}

#[test]
fn weak_lock_and_expiry()
{
    let o = Strong::new(String::from("O"));
    let w = o.weak();
    assert!(!w.expired());
    let locked = w.lock().unwrap();
    assert!(Strong::ptr_eq(&locked, &o));
    assert_eq!(o.strong_count(), 2);

    drop(locked);
    drop(o);
    assert!(w.expired());
    assert!(w.lock().is_none());
}

#[test]
fn weak_survives_copy_move_and_assignment()
{
    let o = Strong::new(1u8);
    let w = o.weak();
    let copied = w.clone();
    let moved = copied;
    let mut assigned = Weak::new();
    assert!(assigned.expired());
    assigned = moved.clone();

    assert!(!assigned.expired());
    drop(o);
    for w in [w, moved, assigned] {
        assert!(w.expired());
        assert!(w.lock().is_none());
    }
}

#[test]
fn owner_order()
{
    let w0a = Weak::<u8>::default();
    let w0b = Weak::<u8>::default();
    assert!(!w0a.owner_before(&w0b));
    assert!(!w0b.owner_before(&w0a));

    let one = Strong::new(1u8);
    let two = Strong::new(2u8);
    let w1a = one.weak();
    let w1b = one.weak();
    assert!(!w1a.owner_before(&w1b));
    assert!(!w1b.owner_before(&w1a));

    let w2 = two.weak();
    assert!(w1a.owner_before(&w2) ^ w2.owner_before(&w1a));

    // Expiry does not move a handle within the order.
    let before = w1a.owner_cmp(&w2);
    drop(one);
    assert_eq!(w1a.owner_cmp(&w2), before);
}

#[test]
fn erased_handles()
{
    let o = Strong::new(7i64);
    let any = o.as_any();
    assert!(any.is::<i64>());
    assert!(any.downcast::<u64>().is_none());
    assert_eq!(*any.downcast::<i64>().unwrap(), 7);
    assert_eq!(any.id(), o.id());

    let w = o.weak_any();
    assert_eq!(w.downcast::<i64>().and_then(|w| w.lock()).map(|s| *s), Some(7));
    drop(any);
    drop(o);
    assert!(w.lock().is_none());
}

#[test]
fn observers_fire_in_order_and_may_unsubscribe_themselves()
{
    let o = Strong::new(());
    let log = Arc::new(Mutex::new(Vec::new()));
    let token = Arc::new(Mutex::new(None));

    let first = {
        let log = Arc::clone(&log);
        let token = Arc::clone(&token);
        let weak = o.weak();
        o.add_observer(move |e: &ModifiedEvent| {
            log.lock().unwrap().push(("first", e.mtime));
            if let (Some(o), Some(t)) = (weak.lock(), *token.lock().unwrap()) {
                o.remove_observer(t);
            }
        })
    };
    *token.lock().unwrap() = Some(first);
    {
        let log = Arc::clone(&log);
        o.add_observer(move |e: &ModifiedEvent| log.lock().unwrap().push(("second", e.mtime)));
    }

    assert_eq!(o.modified(), 1);
    assert_eq!(o.modified(), 2);
    assert_eq!(
        *log.lock().unwrap(),
        vec![("first", 1), ("second", 1), ("second", 2)]
    );
    assert_eq!(o.observer_count(), 1);
    assert!(!o.remove_observer(first));
}

#[test]
fn modified_without_observers_only_bumps_mtime()
{
    let o = Strong::new(());
    for i in 1..=100 {
        assert_eq!(o.modified(), i);
    }
    assert_eq!(o.mtime(), 100);
}

#[test]
fn weak_lock_races_with_drop()
{
    let n = 200;
    for _ in 0..n {
        let o = Strong::new(vec![0u8; 16]);
        let w = o.weak();
        let barrier = Arc::new(Barrier::new(2));
        let locker = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                w.lock().map(|s| s.len())
            })
        };
        barrier.wait();
        drop(o);
        if let Some(len) = locker.join().unwrap() {
            assert_eq!(len, 16);
        }
    }
}

#[test]
fn concurrent_insert_and_modify()
{
    let cache = DataCache::new(CacheConfig::default());
    let context = Strong::new(());
    let inputs: Vec<Strong<AtomicUsize>> = (0..8)
        .map(|_| Strong::new(AtomicUsize::new(0)))
        .collect();

    thread::scope(|s| {
        for (i, input) in inputs.iter().enumerate() {
            let cache = &cache;
            let context = &context;
            s.spawn(move || {
                for round in 0..100 {
                    let data_key = key!["input", i, input];
                    if cache.lookup::<usize>(&data_key).is_none() {
                        let value = input.load(Ordering::Relaxed);
                        let observer_key = key![&data_key, context];
                        let payload = Strong::new(value);
                        let _ = cache.insert(context, payload, data_key.clone(), observer_key);
                    }
                    if round % 3 == 0 {
                        input.fetch_add(1, Ordering::Relaxed);
                        input.modified();
                        assert!(cache.lookup::<usize>(&data_key).is_none());
                    }
                }
            });
        }
    });

    for (i, input) in inputs.iter().enumerate() {
        if let Some(v) = cache.lookup::<usize>(&key!["input", i, input]) {
            assert_eq!(*v, input.load(Ordering::Relaxed));
        }
    }
    let stats = cache.stats();
    assert_eq!(stats.entries, stats.observers);

    context.modified();
    assert!(cache.is_empty());
    assert_eq!(cache.stats().watched_objects, 0);
}

fn leak_singleton() -> &'static Singleton<AtomicUsize>
{
    let singleton = Singleton::new(
        "Counter",
        || Arc::new(AtomicUsize::new(0)),
        |c: &AtomicUsize| c.store(usize::MAX, Ordering::Relaxed),
    );
    Box::leak(Box::new(singleton))
}

#[test]
fn singleton_lifecycle()
{
    let singleton = leak_singleton();
    assert!(singleton.get().is_none());

    let first = singleton.manage();
    first.fetch_add(1, Ordering::Relaxed);
    let second = first.clone();
    assert_eq!(singleton.managers(), 2);
    assert_eq!(singleton.lifetimes(), 1);
    assert_eq!(singleton.get().unwrap().load(Ordering::Relaxed), 1);

    let late = singleton.get().unwrap();
    drop(first);
    assert!(singleton.is_live());
    drop(second);
    assert!(singleton.get().is_none());
    assert_eq!(late.load(Ordering::Relaxed), usize::MAX);

    let again = singleton.manage();
    assert_eq!(singleton.lifetimes(), 2);
    assert_eq!(again.load(Ordering::Relaxed), 0);
}

#[cfg(feature = "global")]
#[test]
fn runtime_holds_the_global_cache_until_dropped()
{
    let runtime = Runtime::enter();
    let cache = global_cache().unwrap();
    assert!(Arc::ptr_eq(&cache, runtime.cache()));

    let context = Strong::new(());
    let data_key = key!["global", &context];
    cache
        .insert(&context, Strong::new(1u8), data_key.clone(), key![&context])
        .unwrap();
    assert_eq!(runtime.cache().lookup::<u8>(&data_key).as_deref(), Some(&1));
    context.modified();
    assert!(!runtime.cache().contains(&data_key));

    let data_key = key!["global", &context];
    cache
        .insert(&context, Strong::new(2u8), data_key.clone(), key![&context])
        .unwrap();
    assert_eq!(context.observer_count(), 1);

    drop(runtime);
    assert!(global_cache().is_none());
    assert!(cache.is_empty());
    assert!(cache.lookup::<u8>(&data_key).is_none());
    assert_eq!(context.observer_count(), 0);
}

#[test]
fn config_deserializes_with_defaults()
{
    let config: CacheConfig = serde_json::from_str(r#"{"insert_policy": "replace"}"#).unwrap();
    assert_eq!(config.insert_policy, InsertPolicy::Replace);
    assert!(config.validate_mtimes);

    let config: CacheConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config, CacheConfig::default());
}

proptest! {
    #[test]
    fn key_equality_follows_components(
        a in prop::collection::vec((any::<bool>(), any::<i64>(), "[a-z]{0,4}"), 0..6),
        b in prop::collection::vec((any::<bool>(), any::<i64>(), "[a-z]{0,4}"), 0..6),
    ) {
        let build = |parts: &[(bool, i64, String)]| -> Key {
            parts
                .iter()
                .map(|(s, i, t)| if *s { Component::from(t.as_str()) } else { Component::from(*i) })
                .collect()
        };
        let ka = build(&a[..]);
        let kb = build(&b[..]);
        prop_assert_eq!(ka == kb, ka.components() == kb.components());
        if ka == kb {
            prop_assert_eq!(ka.hash_value(), kb.hash_value());
        }
        prop_assert_eq!(&ka, &build(&a[..]));
    }

    #[test]
    fn object_components_track_mtime(bumps in 0u64..20) {
        let o = Strong::new(());
        let before = key!["o", &o];
        for _ in 0..bumps {
            o.modified();
        }
        let after = key!["o", &o];
        prop_assert_eq!(before == after, bumps == 0);
        prop_assert!(after.is_current());
        prop_assert_eq!(before.is_current(), bumps == 0);
    }
}
