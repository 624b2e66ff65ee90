use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use sas_eft::clock::ManualClock;
use sas_eft::config::EftConfig;
use sas_eft::controller::{ControllerParts, EftController};
use sas_eft::egm::SimulatedEgm;
use sas_eft::eligibility::EligibilityPolicy;
use sas_eft::handler::{DepositHandler, WithdrawalHandler};
use sas_eft::history::HistoryLog;
use sas_eft::ledger::CreditLedger;
use sas_eft::storage::MemoryStorage;
use sas_eft::{Amount, EftCommand, TransferRequest};

/// Controller over in-memory storage with a ledger large enough to never
/// clamp the benchmarked transfers.
fn setup() -> (EftController, Arc<ManualClock>) {
    let config = EftConfig::default();
    let egm = Arc::new(SimulatedEgm::new());
    let ledger = Arc::new(CreditLedger::new(Amount::from_cents(u64::MAX / 2)));
    let clock = Arc::new(ManualClock::new());
    let controller = EftController::new(ControllerParts {
        history: Arc::new(HistoryLog::load(Arc::new(MemoryStorage::new())).unwrap()),
        policy: EligibilityPolicy::from_config(egm.clone(), &config),
        handlers: vec![
            Arc::new(DepositHandler::new(ledger.clone())),
            Arc::new(WithdrawalHandler::new(ledger)),
        ],
        disable_manager: egm,
        clock: clock.clone(),
        phase_timeout: config.phase_timeout(),
    });
    (controller, clock)
}

/// Transaction numbers cycle through 1..=255, skipping the reserved 0.
fn transaction_number(i: u32) -> u8 {
    (i % 255) as u8 + 1
}

/// First phase, acknowledgement and timeout for `count` deposits.
fn run_handshakes(controller: &EftController, clock: &ManualClock, count: u32) {
    for i in 0..count {
        let tx = transaction_number(i);
        let amount = Amount::from_cents(100);
        for ack in [false, true] {
            let request = TransferRequest::new(EftCommand::D0, tx, amount, ack);
            let _ = black_box(controller.handle(request));
        }
        clock.advance(Duration::from_millis(800));
    }
}

fn bench_full_handshake(c: &mut Criterion) {
    let mut group = c.benchmark_group("handshake");

    for count in [100u32, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let (controller, clock) = setup();
                run_handshakes(&controller, &clock, count);
                controller
            });
        });
    }

    group.finish();
}

fn bench_rejected_messages(c: &mut Criterion) {
    let mut group = c.benchmark_group("rejected");

    // acks without a first phase never reach the log
    group.bench_function("10k_invalid_ack", |b| {
        b.iter(|| {
            let (controller, _clock) = setup();
            for i in 0..10_000u32 {
                let request = TransferRequest::new(
                    EftCommand::D0,
                    transaction_number(i),
                    Amount::from_cents(100),
                    true,
                );
                let _ = black_box(controller.handle(request));
            }
            controller
        });
    });

    group.finish();
}

criterion_group!(benches, bench_full_handshake, bench_rejected_messages);
criterion_main!(benches);
