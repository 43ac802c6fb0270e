//! Kill switch shared between independent mappings of one file, the way an
//! operator process and the order path share it.

use std::thread;

use flash_feed::gate::IntentKind;
use flash_feed::{FastGate, KillSwitch, OrderIntent, OrderSide, RejectReason, RiskDecision, RiskLimits};

fn intent(kind: IntentKind) -> OrderIntent {
    OrderIntent {
        instrument: 1,
        side: OrderSide::Sell,
        kind,
        price: 2026,
        qty: 1,
        strategy_id: 1,
        client_order_id: 1,
    }
}

#[test]
fn test_operator_mapping_stops_gate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kill");
    let gate_side = KillSwitch::create(&path, false).unwrap();
    let operator = KillSwitch::open(&path).unwrap();

    let mut gate = FastGate::new(gate_side, RiskLimits::default());
    assert!(gate.check(&intent(IntentKind::New), 0).is_pass());

    assert!(operator.engage());
    let killed = RiskDecision::Reject(RejectReason::KillSwitchEngaged);
    assert_eq!(gate.check(&intent(IntentKind::New), 1), killed);
    // Cancels are stopped too
    assert_eq!(gate.check(&intent(IntentKind::Cancel), 2), killed);
    assert_eq!(gate.counters().killed, 2);

    operator.reset();
    assert!(gate.check(&intent(IntentKind::New), 3).is_pass());
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kill");
    KillSwitch::create(&path, true).unwrap();
    let reopened = KillSwitch::open(&path).unwrap();
    assert!(reopened.is_engaged());
    assert!(!reopened.engage());
}

#[test]
fn test_concurrent_engage_flips_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kill");
    KillSwitch::create(&path, false).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let path = path.clone();
            thread::spawn(move || KillSwitch::open(&path).unwrap().engage())
        })
        .collect();
    let flips = handles.into_iter().map(|h| h.join().unwrap()).filter(|&f| f).count();
    assert_eq!(flips, 1);
    assert!(KillSwitch::open(&path).unwrap().is_engaged());
}

#[test]
fn test_open_rejects_wrong_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not-a-switch");
    std::fs::write(&path, [0u8; 16]).unwrap();
    assert!(KillSwitch::open(&path).is_err());
}
