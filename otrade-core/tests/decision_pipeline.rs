//! End-to-end pipeline tests: bars -> analysis -> recall -> decision -> order
//! plan -> lifecycle -> learning.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};

use otrade_core::analysis::{AnalyzerConfig, MarketRegime, MultiTimeframeAnalyzer};
use otrade_core::decision::{DecisionSynthesizer, OracleScore};
use otrade_core::domain::{
    AccountState, Bar, Direction, ExitReason, OrderPlan, Position, SymbolConstraints, Tick,
    TicketId, Timeframe, TrailingPolicy,
};
use otrade_core::lifecycle::{CloseFill, LifecycleAction, LifecycleConfig, PositionLifecycleManager};
use otrade_core::memory::{LearnSample, MemoryConfig, PatternMemory, PatternPredictor};
use otrade_core::risk::{NoTrade, RiskConfig, RiskManager};

const TIMEFRAMES: [Timeframe; 3] = [Timeframe::M15, Timeframe::H1, Timeframe::H4];

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).single().unwrap()
}

fn trending_bars(tf: Timeframe, n: usize, step: f64) -> Vec<Bar> {
    (0..n)
        .map(|i| {
            let open = 1.1 + i as f64 * step;
            let close = open + step;
            Bar {
                timeframe: tf,
                open_time: t0() + tf.duration() * i as i32,
                open,
                high: open.max(close) + 0.0002,
                low: open.min(close) - 0.0002,
                close,
                volume: 500.0,
            }
        })
        .collect()
}

fn all_timeframes(step: f64) -> BTreeMap<Timeframe, Vec<Bar>> {
    TIMEFRAMES
        .iter()
        .map(|tf| (*tf, trending_bars(*tf, 150, step)))
        .collect()
}

fn analyzer() -> MultiTimeframeAnalyzer {
    MultiTimeframeAnalyzer::new(&TIMEFRAMES, Timeframe::M15, AnalyzerConfig::default())
}

fn tick(price: f64) -> Tick {
    Tick {
        bid: price,
        ask: price + 0.0002,
        time: t0(),
    }
}

fn other_position(symbol: &str) -> Position {
    let plan = OrderPlan {
        symbol: symbol.into(),
        direction: Direction::Long,
        volume: 0.1,
        entry_price: 1.3,
        stop_loss: 1.29,
        take_profit: 1.32,
        trailing_policy: TrailingPolicy::disabled(),
        confidence: 0.7,
    };
    Position::pending(&plan, vec![], t0())
}

#[test]
fn all_up_with_long_oracle_sizes_an_order() {
    let a = analyzer();
    let states = a.analyze("EURUSD", &all_timeframes(0.0004)).unwrap();
    let view = a.market_view("EURUSD", states);
    assert_eq!(view.regime.regime, MarketRegime::TrendingBullish);

    let synth = DecisionSynthesizer::default();
    let decision = synth.decide(
        &view,
        &[],
        Some(OracleScore {
            direction: Direction::Long,
            confidence: 0.9,
        }),
    );
    assert_eq!(decision.direction, Direction::Long);
    assert!(decision.confidence >= synth.config().agreement_threshold);

    let risk = RiskManager::new(RiskConfig::default());
    let account = AccountState::flat(10_000.0, "USD");
    let constraints = SymbolConstraints::fx_major();
    let close = view.primary_state().unwrap().close;
    let plan = risk
        .size(&decision, &view, &tick(close), &account, &[], &constraints, t0())
        .expect("order plan");
    assert!(plan.volume > 0.0);
    let max_loss = constraints.profit_for(plan.stop_distance(), plan.volume);
    assert!(max_loss <= account.equity * risk.config().risk_fraction + 1e-9);
}

#[test]
fn oracle_timeout_still_decides_from_rules_and_memory() {
    let a = analyzer();
    let view = a.market_view(
        "EURUSD",
        a.analyze("EURUSD", &all_timeframes(0.0004)).unwrap(),
    );

    // Memory remembers three winning longs in this exact state
    let mut mem = PatternMemory::new(MemoryConfig::default());
    for i in 0..3 {
        mem.learn(
            LearnSample {
                features: view.features.clone(),
                direction: Direction::Long,
                outcome: otrade_core::memory::OutcomeLabel::Win,
                realized_return: 0.004,
                symbol: "EURUSD".into(),
            },
            t0() + Duration::minutes(i),
        );
    }
    let hits = mem.recall(&view.features, 5, t0() + Duration::hours(1));
    assert_eq!(hits.len(), 3);

    let decision = DecisionSynthesizer::default().decide(&view, &hits, None);
    assert!(decision.has_tag("oracle_unavailable"));
    assert_eq!(decision.direction, Direction::Long);
    assert!(decision.confidence > 0.0);
}

#[test]
fn oracle_timeout_without_memory_is_flat_not_an_error() {
    let a = analyzer();
    let view = a.market_view(
        "EURUSD",
        a.analyze("EURUSD", &all_timeframes(0.0004)).unwrap(),
    );
    let decision = DecisionSynthesizer::default().decide(&view, &[], None);
    assert_eq!(decision.direction, Direction::Flat);
}

#[test]
fn max_exposure_returns_none_regardless_of_confidence() {
    let a = analyzer();
    let view = a.market_view(
        "EURUSD",
        a.analyze("EURUSD", &all_timeframes(0.0004)).unwrap(),
    );
    let decision = otrade_core::domain::Decision {
        symbol: "EURUSD".into(),
        direction: Direction::Long,
        confidence: 1.0,
        rationale_tags: vec![],
    };
    let risk = RiskManager::new(RiskConfig {
        max_open_positions: 2,
        ..RiskConfig::default()
    });
    let book = vec![other_position("GBPUSD"), other_position("AUDUSD")];
    let account = AccountState::flat(50_000.0, "USD");
    let result = risk.evaluate(
        &decision,
        &view,
        &tick(1.16),
        &account,
        &book,
        &SymbolConstraints::fx_major(),
        t0(),
    );
    assert!(matches!(result, Err(NoTrade::MaxExposure { open: 2, max: 2 })));
}

#[test]
fn closed_position_becomes_exactly_one_pattern() {
    let a = analyzer();
    let view = a.market_view(
        "EURUSD",
        a.analyze("EURUSD", &all_timeframes(0.0004)).unwrap(),
    );
    let plan = OrderPlan {
        symbol: "EURUSD".into(),
        direction: Direction::Long,
        volume: 0.5,
        entry_price: 1.16,
        stop_loss: 1.158,
        take_profit: 1.164,
        trailing_policy: TrailingPolicy::disabled(),
        confidence: 0.8,
    };
    let mut lifecycle = PositionLifecycleManager::new(LifecycleConfig::default());
    lifecycle
        .begin_entry(&plan, view.features.clone(), t0())
        .unwrap();
    lifecycle
        .confirm_entry("EURUSD", TicketId::from(42), None, t0())
        .unwrap();

    let ticks = BTreeMap::from([("EURUSD".to_string(), tick(1.1645))]);
    let actions = lifecycle.track(&ticks, &HashSet::new(), t0() + Duration::minutes(20));
    assert!(matches!(
        actions.as_slice(),
        [LifecycleAction::Close {
            reason: ExitReason::TakeProfit,
            ..
        }]
    ));

    let constraints = SymbolConstraints::fx_major();
    let trade = lifecycle
        .complete_close(
            "EURUSD",
            CloseFill {
                exit_price: 1.1645,
                profit: constraints.profit_for(1.1645 - 1.16, 0.5),
                estimated: false,
            },
            t0() + Duration::minutes(21),
        )
        .unwrap();

    let mut mem = PatternMemory::new(MemoryConfig::default());
    let record = mem.learn(
        LearnSample::from_trade(&trade, mem.config().neutral_band),
        trade.closed_at,
    );
    assert_eq!(mem.len(), 1);
    assert_eq!(record.feature_vector, view.features);
    assert_eq!(record.outcome_label, otrade_core::memory::OutcomeLabel::Win);
    assert!(lifecycle.is_empty());
}
