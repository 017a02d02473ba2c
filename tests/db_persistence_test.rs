//! Test to verify database persistence across restarts
//! Game results and analytics rollups must survive closing and reopening RocksDB

use spinwire::{
    config::LastPlayedPolicy,
    games::{GameResult, Symbol},
    Aggregator, OptimizedStorage, ResultStore, RocksResultStore,
};
use tempfile::TempDir;

fn spin(user: &str, symbols: [Symbol; 3], bet: f64, timestamp: f64) -> GameResult {
    let payout = if symbols.iter().all(|s| *s == symbols[0]) {
        bet * symbols[0].multiplier()
    } else {
        0.0
    };
    GameResult {
        id: None,
        user_id: user.to_string(),
        bet,
        payout,
        symbols,
        timestamp,
    }
}

#[test]
fn test_db_persistence_across_restarts() {
    let dir = TempDir::new().unwrap();
    let results_path = dir.path().join("results");
    let analytics_path = dir.path().join("analytics");

    // === PHASE 1: persist results and apply them, then close both DBs ===
    let ids: Vec<String> = {
        let store = RocksResultStore::new(OptimizedStorage::new(&results_path).unwrap());
        let aggregator = Aggregator::new(
            OptimizedStorage::new(&analytics_path).unwrap(),
            LastPlayedPolicy::Latest,
        );

        let spins = [
            spin("p1", [Symbol::Star; 3], 5.0, 1_704_110_400.0),
            spin("p2", [Symbol::Cherry, Symbol::Grape, Symbol::Cherry], 2.0, 1_704_110_401.0),
            spin("p1", [Symbol::Lemon, Symbol::Orange, Symbol::Diamond], 1.0, 1_704_110_402.0),
        ];
        spins
            .into_iter()
            .map(|s| {
                let stored = store.persist(s).unwrap();
                aggregator.apply_game_result(&stored).unwrap();
                stored.id.unwrap()
            })
            .collect()
    };

    // === PHASE 2: reopen and verify everything is still there ===
    let store = RocksResultStore::new(OptimizedStorage::new(&results_path).unwrap());
    for id in &ids {
        let result = store.load(id).unwrap().expect("result lost across restart");
        assert_eq!(result.id.as_deref(), Some(id.as_str()));
    }

    let (recent, _) = store.recent(None, 10).unwrap();
    let recent_ids: Vec<String> = recent.into_iter().filter_map(|r| r.id).collect();
    let newest_first: Vec<String> = ids.iter().rev().cloned().collect();
    assert_eq!(recent_ids, newest_first);

    let aggregator = Aggregator::new(
        OptimizedStorage::new(&analytics_path).unwrap(),
        LastPlayedPolicy::Latest,
    );
    let daily = aggregator.reader().recent_daily_stats(1).unwrap();
    assert_eq!(daily[0].total_games, 3);
    assert_eq!(daily[0].total_bets, 8.0);
    assert_eq!(daily[0].total_payouts, 50.0);
    assert_eq!(daily[0].unique_players.len(), 2);

    // Records are immutable
    let mut again = store.load(&ids[0]).unwrap().unwrap();
    again.bet = 100.0;
    assert!(store.persist(again).is_err());
}

#[test]
fn test_replaying_results_rebuilds_identical_rollups() {
    let dir = TempDir::new().unwrap();
    let store = RocksResultStore::new(OptimizedStorage::new(dir.path().join("results")).unwrap());
    let live = Aggregator::new(
        OptimizedStorage::new(dir.path().join("live")).unwrap(),
        LastPlayedPolicy::Latest,
    );

    for i in 0..30 {
        let symbols = if i % 3 == 0 {
            [Symbol::Cherry; 3]
        } else {
            [Symbol::Cherry, Symbol::Lemon, Symbol::Orange]
        };
        let stored = store
            .persist(spin(&format!("p{}", i % 4), symbols, 1.0 + i as f64, 1_704_000_000.0 + i as f64 * 7_200.0))
            .unwrap();
        live.apply_game_result(&stored).unwrap();
    }

    let rebuilt = Aggregator::new(
        OptimizedStorage::new(dir.path().join("rebuilt")).unwrap(),
        LastPlayedPolicy::Latest,
    );
    store
        .for_each_result(|result| rebuilt.apply_game_result(&result))
        .unwrap();

    let live_days = live.reader().recent_daily_stats(usize::MAX).unwrap();
    let rebuilt_days = rebuilt.reader().recent_daily_stats(usize::MAX).unwrap();
    assert_eq!(live_days.len(), rebuilt_days.len());
    for (a, b) in live_days.iter().zip(&rebuilt_days) {
        assert_eq!(a.date, b.date);
        assert_eq!(a.total_games, b.total_games);
        assert!((a.total_bets - b.total_bets).abs() < 1e-9);
        assert!((a.total_payouts - b.total_payouts).abs() < 1e-9);
        assert_eq!(a.unique_players, b.unique_players);
    }

    for user in ["p0", "p1", "p2", "p3"] {
        let a = live.reader().player_stat(user).unwrap().unwrap();
        let b = rebuilt.reader().player_stat(user).unwrap().unwrap();
        assert_eq!(a.total_games, b.total_games);
        assert_eq!(a.last_played, b.last_played);
    }
}
