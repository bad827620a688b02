use switchboard_core::config::RuntimeConfig;
use switchboard_core::runtime::aarch64;
use switchboard_core::runtime::{sled_len, BranchSled, BufferRegion, CodeRegion, Fallback, Route, SledError, SledState};

const BASE: u64 = 0x40_0000;
const RESOLVER: u64 = BASE + 0x10_0000;

fn sled(capacity: usize) -> BranchSled<BufferRegion> {
    let region = BufferRegion::zeroed(BASE, sled_len(capacity));
    BranchSled::new(region, capacity, Fallback::Resolver(RESOLVER)).expect("sled")
}

#[test]
fn registered_range_reaches_its_handler() {
    let handler = BASE + 0x8000;
    let mut s = sled(64);
    s.register_handler(handler, 100, 200).expect("register");

    for id in [100, 150, 200] {
        assert_eq!(s.route(id).expect("route"), Route::Target(handler), "id {id}");
    }
    for id in [0, 99, 201, u64::MAX] {
        assert_eq!(s.route(id).expect("route"), Route::Fallback, "id {id}");
    }
}

#[test]
fn ranges_beyond_twelve_bits_and_far_bases() {
    let mut s = sled(128);
    let mid = BASE + 0x9000;
    let far = BASE + 0xa000;
    s.register_handler(mid, 0x12345, 0x12345 + 5000).expect("mid range");
    s.register_handler(far, 0x1_0000_0000, 0x1_0000_0fff).expect("far range");

    assert_eq!(s.route(0x12345).expect("route"), Route::Target(mid));
    assert_eq!(s.route(0x12345 + 5000).expect("route"), Route::Target(mid));
    assert_eq!(s.route(0x12344).expect("route"), Route::Fallback);
    assert_eq!(s.route(0x1_0000_0800).expect("route"), Route::Target(far));
    assert_eq!(s.route(0xffff_ffff).expect("route"), Route::Fallback);
}

#[test]
fn wraparound_keeps_the_fallback_word() {
    let mut s = sled(16);
    let fallback_word = s.region().read_word(16).expect("fallback word");
    assert_eq!(s.state(), SledState::Empty);

    let target = |id: u64| BASE + 0x1000 * (id + 1);
    for id in 1..=2 {
        s.learn(id, target(id)).expect("learn");
    }
    assert_eq!(s.state(), SledState::Partial);
    s.learn(3, target(3)).expect("learn");
    assert_eq!(s.state(), SledState::Full);
    assert!(!s.has_wrapped());
    for id in 1..=3 {
        assert_eq!(s.route(id).expect("route"), Route::Target(target(id)));
    }

    s.learn(4, target(4)).expect("learn past capacity");
    assert!(s.has_wrapped());
    assert_eq!(s.state(), SledState::Partial);
    assert_eq!(s.live_entries(), 1);
    assert_eq!(s.region().read_word(16), Some(fallback_word));
    assert_eq!(s.route(4).expect("route"), Route::Target(target(4)));
    for id in 1..=3 {
        assert_eq!(s.route(id).expect("route"), Route::Fallback, "id {id}");
    }

    // Misses after the wrap still reach the resolver and are re-learned.
    let mut resolver = |id: u64| Some(target(id));
    assert_eq!(s.dispatch(1, &mut resolver).expect("dispatch"), target(1));
    assert_eq!(s.region().read_word(16), Some(fallback_word));
}

#[test]
fn fallback_word_branches_to_the_resolver() {
    let s = sled(16);
    let word = s.region().read_word(16).expect("word");
    let Some(aarch64::Insn::B { offset }) = aarch64::decode(word) else {
        panic!("fallback word {word:#010x} is not a branch");
    };
    assert_eq!(s.fallback_address().wrapping_add((offset * 4) as u64), RESOLVER);
}

#[test]
fn secondary_sled_traps_outside_registered_ranges() {
    let config = RuntimeConfig::default();
    let region = BufferRegion::zeroed(BASE, sled_len(config.secondary_capacity));
    let mut s = BranchSled::secondary(region, &config).expect("secondary");
    assert_eq!(s.route(5).expect("route"), Route::Trap);

    s.register_handler(BASE + 0x8000, 10, 20).expect("register");
    assert_eq!(s.route(15).expect("route"), Route::Target(BASE + 0x8000));
    assert_eq!(s.route(21).expect("route"), Route::Trap);

    let mut resolver = |_: u64| Some(BASE);
    assert!(matches!(s.dispatch(21, &mut resolver), Err(SledError::Trapped(21))));
}

#[test]
fn primary_sled_uses_configured_capacity() {
    let config = RuntimeConfig { sled_capacity: 32, ..RuntimeConfig::default() };
    let region = BufferRegion::zeroed(BASE, sled_len(32));
    let s = BranchSled::primary(region, &config, RESOLVER).expect("primary");
    assert_eq!(s.capacity(), 32);
    assert_eq!(s.fallback(), Fallback::Resolver(RESOLVER));
    assert_eq!(s.route(1).expect("route"), Route::Fallback);
}

#[test]
fn rejects_small_regions_and_distant_targets() {
    let region = BufferRegion::zeroed(BASE, 16);
    assert!(matches!(
        BranchSled::new(region, 16, Fallback::Trap),
        Err(SledError::RegionTooSmall { .. })
    ));

    let mut s = sled(16);
    assert!(matches!(s.learn(3, BASE + (1 << 28)), Err(SledError::OutOfRange { .. })));
}

#[test]
fn ranges_overwritten_by_a_wrap_can_be_registered_again() {
    let mut s = sled(16);
    let old_handler = BASE + 0x8000;
    let new_handler = BASE + 0x9000;
    s.register_handler(old_handler, 100, 200).expect("register");
    for id in 1..=3 {
        s.learn(id, BASE + 0x1000 * id).expect("learn");
    }
    assert!(s.has_wrapped());
    assert_eq!(s.route(150).expect("route"), Route::Fallback);

    s.register_handler(new_handler, 100, 200).expect("register after wrap");
    assert_eq!(s.route(150).expect("route"), Route::Target(new_handler));
    assert!(matches!(s.register_handler(old_handler, 180, 220), Err(SledError::OverlappingRange { .. })));
}

#[test]
fn learning_a_known_identifier_writes_nothing() {
    let mut s = sled(64);
    s.learn(7, BASE + 0x7000).expect("learn");
    let words: Vec<Option<u32>> = (0..=64).map(|i| s.region().read_word(i)).collect();

    s.learn(7, BASE + 0x7000).expect("learn again");
    s.learn(7, BASE + 0x7100).expect("learn other target");
    assert_eq!(s.entries(), 1);
    assert_eq!(s.route(7).expect("route"), Route::Target(BASE + 0x7000));
    let after: Vec<Option<u32>> = (0..=64).map(|i| s.region().read_word(i)).collect();
    assert_eq!(words, after);
}
