//! End-to-end tests for the scan ledger
//!
//! Every scenario drives the public `ScanLedger` API the way a request
//! handler would: record scans, then read the projections.

use chrono::{DateTime, TimeZone, Utc};
use tradepost::{
    ChunkCoord, ChunkQuery, Dimension, IngestOptions, IngestReport, LedgerConfig, LedgerError, NewScan,
    OfferQuery, Position, ScanBatch, ScanLedger, ShopAction, ShopFilter, ShopObservation,
    ShopState, WaystoneFilter, WaystoneObservation, WaystoneSource, WaystoneState,
};
use tempfile::TempDir;

// ============================================================================
// Fixtures
// ============================================================================

fn at(x: i32, y: i32, z: i32) -> Position {
    Position::new(Dimension::Overworld, x, y, z)
}

fn time(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

fn scan_of(chunk_x: i32, chunk_z: i32, seconds: i64) -> NewScan {
    NewScan {
        sender_id: "scanner-1".to_string(),
        dimension: Dimension::Overworld,
        chunk: ChunkCoord::new(chunk_x, chunk_z),
        scanned_at: time(seconds),
    }
}

fn shop(position: Position, owner: &str, item: &str, price: f64, action: ShopAction) -> ShopObservation {
    ShopObservation {
        position,
        owner: owner.to_string(),
        item: item.to_string(),
        price,
        amount: 1,
        action,
    }
}

fn sell(position: Position, price: f64) -> ShopObservation {
    shop(position, "alice", "diamond", price, ShopAction::Sell)
}

fn named_sighting(position: Position, name: &str) -> WaystoneObservation {
    WaystoneObservation::Chunk {
        position,
        name: Some(name.to_string()),
        owner: Some("warden".to_string()),
    }
}

fn ui_waystone(position: Position, name: &str) -> WaystoneObservation {
    WaystoneObservation::Ui {
        position,
        name: name.to_string(),
        owner: "warden".to_string(),
    }
}

fn ingest(
    ledger: &ScanLedger,
    scan: NewScan,
    shops: &[ShopObservation],
    waystones: &[WaystoneObservation],
) -> IngestReport {
    ledger
        .ingest_scan(&scan, shops, waystones, IngestOptions::default())
        .expect("ingest failed")
}

fn active_shops(ledger: &ScanLedger) -> Vec<ShopState> {
    ledger.query_active_shops(&ShopFilter::default()).unwrap()
}

fn active_waystones(ledger: &ScanLedger) -> Vec<WaystoneState> {
    ledger
        .query_active_waystones(&WaystoneFilter::default())
        .unwrap()
}

/// Chunk summaries with the clock fixed at `time(3_010)`.
fn chunks(ledger: &ScanLedger, query: &ChunkQuery) -> Vec<tradepost::ChunkSummary> {
    ledger.chunk_summaries(query, time(3_010)).unwrap()
}

fn active_shop_at(ledger: &ScanLedger, position: Position) -> Option<ShopState> {
    active_shops(ledger)
        .into_iter()
        .find(|s| s.position == position)
}

// ============================================================================
// Reconciliation
// ============================================================================

#[test]
fn reingesting_identical_scan_only_advances_last_seen() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    let shops = [sell(at(1, 64, 1), 10.0), sell(at(5, 64, 9), 4.0)];
    let waystones = [named_sighting(at(8, 70, 8), "Market")];

    ingest(&ledger, scan_of(0, 0, 0), &shops, &waystones);
    let shops_before = active_shops(&ledger);
    let waystones_before = active_waystones(&ledger);

    let report = ingest(&ledger, scan_of(0, 0, 60), &shops, &waystones);
    assert_eq!(report.shops.extended, 2);
    assert_eq!(report.shops.inserted + report.shops.superseded + report.shops.pruned, 0);
    assert_eq!(report.waystones.extended, 1);
    assert_eq!(report.annotations_recomputed, 0);

    let shops_after = active_shops(&ledger);
    assert_eq!(shops_after.len(), shops_before.len());
    for (before, after) in shops_before.iter().zip(&shops_after) {
        assert_eq!(after.id, before.id);
        assert_eq!(after.price, before.price);
        assert_eq!(after.first_seen_at, before.first_seen_at);
        assert_eq!(after.nearest_waystone, before.nearest_waystone);
        assert_eq!(after.last_seen_at, time(60));
        assert_eq!(after.last_seen_scan, report.scan_id);
    }

    let waystones_after = active_waystones(&ledger);
    assert_eq!(waystones_after.len(), 1);
    assert_eq!(waystones_after[0].id, waystones_before[0].id);
    assert_eq!(waystones_after[0].last_seen_at, time(60));
}

#[test]
fn empty_scan_prunes_only_its_own_chunk() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    let p = at(1, 64, 1);
    ingest(&ledger, scan_of(0, 0, 0), &[sell(p, 10.0)], &[]);

    let elsewhere = ingest(&ledger, scan_of(1, 0, 10), &[], &[]);
    assert_eq!(elsewhere.shops.pruned, 0);
    assert!(active_shop_at(&ledger, p).is_some());

    let covering = ingest(&ledger, scan_of(0, 0, 20), &[], &[]);
    assert_eq!(covering.shops.pruned, 1);
    assert!(active_shop_at(&ledger, p).is_none());

    let history = ledger.shop_history(&p).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].removed_at, Some(time(20)));
}

#[test]
fn observations_outside_the_scan_chunk_prune_their_own_chunk() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    let near = at(1, 64, 1);
    let neighbour_a = at(17, 64, 1);
    let neighbour_b = at(18, 64, 1);
    ingest(
        &ledger,
        scan_of(0, 0, 0),
        &[sell(near, 1.0), sell(neighbour_a, 2.0), sell(neighbour_b, 3.0)],
        &[],
    );

    // Scan of chunk (0,0) that also reports one shop in chunk (1,0).
    let report = ingest(&ledger, scan_of(0, 0, 10), &[sell(near, 1.0), sell(neighbour_a, 2.0)], &[]);
    assert_eq!(report.shops.pruned, 1);
    assert!(active_shop_at(&ledger, neighbour_b).is_none());
    assert!(active_shop_at(&ledger, neighbour_a).is_some());
}

#[test]
fn price_change_creates_a_new_version() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    let p = at(3, 64, 3);
    ingest(&ledger, scan_of(0, 0, 0), &[sell(p, 10.0)], &[]);
    let report = ingest(&ledger, scan_of(0, 0, 30), &[sell(p, 12.0)], &[]);
    assert_eq!(report.shops.superseded, 1);

    let history = ledger.shop_history(&p).unwrap();
    assert_eq!(history.len(), 2);
    assert!(!history[0].is_active());
    assert_eq!(history[0].price, 10.0);
    assert_eq!(history[0].removed_at, Some(time(30)));
    assert!(history[1].is_active());
    assert_eq!(history[1].price, 12.0);
    assert_eq!(history[1].first_seen_at, time(30));
}

#[test]
fn same_position_twice_in_one_batch_keeps_the_last() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    let p = at(2, 64, 2);
    let report = ingest(&ledger, scan_of(0, 0, 0), &[sell(p, 1.0), sell(p, 9.0)], &[]);
    assert_eq!(report.shops.inserted, 1);

    let history = ledger.shop_history(&p).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].price, 9.0);
}

#[test]
fn ui_waystone_survives_chunk_rescan() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    let w = at(5, 70, 5);
    let options = IngestOptions {
        skip_shop_reconcile: true,
        ..IngestOptions::default()
    };
    ledger
        .ingest_scan(&scan_of(0, 0, 0), &[], &[ui_waystone(w, "Spawn")], options)
        .unwrap();

    let rescan = ingest(&ledger, scan_of(0, 0, 10), &[], &[]);
    assert_eq!(rescan.waystones.pruned, 0);

    let waystones = active_waystones(&ledger);
    assert_eq!(waystones.len(), 1);
    assert_eq!(waystones[0].source, WaystoneSource::Ui);
    assert_eq!(waystones[0].name, "Spawn");
}

#[test]
fn anonymous_sighting_confirms_but_never_renames() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    let w = at(5, 70, 5);
    ingest(&ledger, scan_of(0, 0, 0), &[], &[named_sighting(w, "Old Mill")]);

    let anonymous = WaystoneObservation::Chunk {
        position: w,
        name: None,
        owner: None,
    };
    let report = ingest(&ledger, scan_of(0, 0, 10), &[], &[anonymous]);
    assert_eq!(report.waystones.extended, 1);

    let history = ledger.waystone_history(&w).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].name, "Old Mill");
    assert_eq!(history[0].last_seen_at, time(10));
}

#[test]
fn shop_missing_amount_never_becomes_state() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    let batch: ScanBatch = serde_json::from_str(
        r#"{
            "senderId": "scanner-1",
            "dimension": "overworld",
            "chunkX": 0,
            "chunkZ": 0,
            "shops": [
                {"owner": "bob", "item": "emerald", "position": [4, 64, 4], "price": 2.5, "action": "buy"}
            ]
        }"#,
    )
    .unwrap();

    let report = ledger.ingest_batch(&batch).unwrap();
    assert_eq!(report.shops.inserted, 0);
    assert!(active_shops(&ledger).is_empty());
    assert!(ledger.shop_history(&at(4, 64, 4)).unwrap().is_empty());
}

#[test]
fn ui_push_leaves_the_scan_chunk_shops_active() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    ingest(&ledger, scan_of(0, 0, 0), &[sell(at(1, 64, 1), 5.0)], &[]);

    let report = ingest(&ledger, scan_of(0, 0, 10), &[], &[ui_waystone(at(2, 64, 2), "Hub")]);
    assert_eq!(report.shops.pruned, 0);
    assert_eq!(report.waystones.inserted, 1);
    assert_eq!(active_shops(&ledger).len(), 1);

    let batch: ScanBatch = serde_json::from_str(
        r#"{
            "senderId": "client-ui",
            "dimension": "overworld",
            "chunkX": 0,
            "chunkZ": 0,
            "waystones": [
                {"position": [3, 64, 3], "name": "Gate", "owner": "warden", "source": "ui"}
            ]
        }"#,
    )
    .unwrap();
    let report = ledger.ingest_batch(&batch).unwrap();
    assert_eq!(report.shops.pruned, 0);
    assert_eq!(active_shops(&ledger).len(), 1);
    assert_eq!(active_waystones(&ledger).len(), 2);
}

#[test]
fn mixed_ui_and_chunk_batch_prunes_nothing() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    let kept_shop = at(1, 64, 1);
    let missing_shop = at(2, 64, 2);
    let mill = at(3, 70, 3);
    let well = at(6, 70, 6);
    ingest(
        &ledger,
        scan_of(0, 0, 0),
        &[sell(kept_shop, 1.0), sell(missing_shop, 2.0)],
        &[named_sighting(mill, "Mill"), named_sighting(well, "Well")],
    );

    let mixed = ingest(
        &ledger,
        scan_of(0, 0, 10),
        &[sell(kept_shop, 1.0)],
        &[ui_waystone(at(9, 70, 9), "Hub"), named_sighting(mill, "Mill")],
    );
    assert_eq!(mixed.shops.extended, 1);
    assert_eq!(mixed.shops.pruned, 0);
    assert_eq!(mixed.waystones.inserted, 1);
    assert_eq!(mixed.waystones.extended, 1);
    assert_eq!(mixed.waystones.pruned, 0);
    assert_eq!(active_shops(&ledger).len(), 2);
    assert_eq!(active_waystones(&ledger).len(), 3);

    // A plain chunk rescan is closed-world again; the ui waystone stays.
    let rescan = ingest(&ledger, scan_of(0, 0, 20), &[sell(kept_shop, 1.0)], &[named_sighting(mill, "Mill")]);
    assert_eq!(rescan.shops.pruned, 1);
    assert_eq!(rescan.waystones.pruned, 1);
    let names: Vec<String> = active_waystones(&ledger).into_iter().map(|w| w.name).collect();
    assert_eq!(names, vec!["Mill".to_string(), "Hub".to_string()]);
}

#[test]
fn skipped_waystone_reconcile_still_reconciles_shops() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    let s = at(1, 64, 1);
    ingest(&ledger, scan_of(0, 0, 0), &[sell(s, 1.0)], &[named_sighting(at(5, 70, 5), "Mill")]);

    let options = IngestOptions {
        skip_waystone_reconcile: true,
        ..IngestOptions::default()
    };
    let report = ledger
        .ingest_scan(&scan_of(0, 0, 10), &[sell(s, 2.0)], &[], options)
        .unwrap();
    assert_eq!(report.shops.superseded, 1);
    assert_eq!(report.waystones.pruned + report.waystones.extended, 0);

    let waystones = active_waystones(&ledger);
    assert_eq!(waystones.len(), 1);
    assert_eq!(waystones[0].last_seen_at, time(0));

    let shop = active_shop_at(&ledger, s).unwrap();
    assert_eq!(shop.price, 2.0);
    assert_eq!(shop.nearest_waystone.unwrap().name, "Mill");
}

// ============================================================================
// Nearest-waystone annotation
// ============================================================================

#[test]
fn nearest_annotation_tracks_creation_and_pruning() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    let s1 = at(0, 64, 0);
    let s2 = at(100, 64, 0);
    let w1 = at(0, 64, 10);
    let w2 = at(100, 64, 20);

    ingest(
        &ledger,
        scan_of(0, 0, 0),
        &[sell(s1, 1.0), sell(s2, 2.0)],
        &[named_sighting(w1, "W1"), named_sighting(w2, "W2")],
    );

    let nearest_s1 = active_shop_at(&ledger, s1).unwrap().nearest_waystone.unwrap();
    assert_eq!(nearest_s1.name, "W1");
    assert_eq!(nearest_s1.distance_sq, 100);
    let nearest_s2 = active_shop_at(&ledger, s2).unwrap().nearest_waystone.unwrap();
    assert_eq!(nearest_s2.name, "W2");
    assert_eq!(nearest_s2.distance_sq, 400);

    // Rescan chunk (0,0): S1 still there, W1 gone.
    let report = ingest(&ledger, scan_of(0, 0, 10), &[sell(s1, 1.0)], &[]);
    assert_eq!(report.waystones.pruned, 1);
    assert_eq!(report.annotations_recomputed, 1);
    let moved = active_shop_at(&ledger, s1).unwrap().nearest_waystone.unwrap();
    assert_eq!(moved.name, "W2");
    assert_eq!(moved.position, w2);
    assert_eq!(moved.distance_sq, 100 * 100 + 20 * 20);

    // Rescan W2's chunk (6,1): nothing left to point at.
    let report = ingest(&ledger, scan_of(6, 1, 20), &[], &[]);
    assert_eq!(report.waystones.pruned, 1);
    assert!(active_shop_at(&ledger, s1).unwrap().nearest_waystone.is_none());
    assert!(active_shop_at(&ledger, s2).unwrap().nearest_waystone.is_none());
}

#[test]
fn new_waystone_reannotates_the_whole_dimension() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    let far_shop = at(200, 64, 0);
    ingest(&ledger, scan_of(0, 0, 0), &[sell(at(1, 64, 1), 1.0)], &[named_sighting(at(0, 64, 0), "Origin")]);
    ingest(&ledger, scan_of(12, 0, 10), &[sell(far_shop, 1.0)], &[]);
    assert_eq!(
        active_shop_at(&ledger, far_shop).unwrap().nearest_waystone.unwrap().name,
        "Origin"
    );

    let options = IngestOptions {
        skip_shop_reconcile: true,
        ..IngestOptions::default()
    };
    let report = ledger
        .ingest_scan(&scan_of(12, 1, 20), &[], &[ui_waystone(at(201, 64, 16), "Far Hub")], options)
        .unwrap();
    assert_eq!(report.annotations_recomputed, 2);

    let nearest = active_shop_at(&ledger, far_shop).unwrap().nearest_waystone.unwrap();
    assert_eq!(nearest.name, "Far Hub");
    assert_eq!(nearest.distance_sq, 1 + 16 * 16);
}

#[test]
fn ui_rename_reannotates_the_whole_dimension() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    let near = at(0, 64, 0);
    let far = at(100, 64, 0);
    let hub = at(0, 64, 10);
    ingest(&ledger, scan_of(0, 0, 0), &[sell(near, 1.0)], &[ui_waystone(hub, "Hub")]);
    ingest(&ledger, scan_of(6, 0, 5), &[sell(far, 1.0)], &[]);
    let before = active_shop_at(&ledger, far).unwrap().nearest_waystone.unwrap();
    assert_eq!(before.name, "Hub");

    let report = ingest(&ledger, scan_of(0, 0, 10), &[], &[ui_waystone(hub, "Grand Hub")]);
    assert_eq!(report.waystones.superseded, 1);
    assert_eq!(report.shops.pruned, 0);
    assert_eq!(report.annotations_recomputed, 2);

    for position in [near, far] {
        let nearest = active_shop_at(&ledger, position).unwrap().nearest_waystone.unwrap();
        assert_eq!(nearest.name, "Grand Hub");
        assert_ne!(nearest.waystone_id, before.waystone_id);
    }
    assert_eq!(ledger.waystone_history(&hub).unwrap().len(), 2);
}

#[test]
fn nearest_for_empty_position_is_computed_on_the_fly() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    ingest(&ledger, scan_of(0, 0, 0), &[], &[named_sighting(at(3, 64, 4), "Well")]);

    let nearest = ledger.nearest_waystone(&at(0, 64, 0)).unwrap().unwrap();
    assert_eq!(nearest.name, "Well");
    assert_eq!(nearest.distance_sq, 25);

    let other_dimension = Position::new(Dimension::Nether, 0, 64, 0);
    assert!(ledger.nearest_waystone(&other_dimension).unwrap().is_none());
}

// ============================================================================
// Failure modes
// ============================================================================

#[test]
fn duplicate_scan_is_reported_and_writes_nothing() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    ingest(&ledger, scan_of(0, 0, 0), &[sell(at(1, 64, 1), 1.0)], &[]);

    let err = ledger
        .ingest_scan(&scan_of(0, 0, 0), &[sell(at(2, 64, 2), 1.0)], &[], IngestOptions::default())
        .unwrap_err();
    assert!(err.is_duplicate());
    assert!(matches!(err, LedgerError::DuplicateScan { chunk_x: 0, chunk_z: 0, .. }));
    assert_eq!(active_shops(&ledger).len(), 1);

    let summaries = chunks(&ledger, &ChunkQuery::default());
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].total_scans, 1);
}

#[test]
fn corrupted_history_aborts_the_whole_scan() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    ingest(&ledger, scan_of(0, 0, 0), &[sell(at(1, 64, 1), 1.0)], &[]);
    ledger
        .connection()
        .execute(
            "INSERT INTO shop_states SELECT * REPLACE (id + 1000 AS id) FROM shop_states",
            &[],
        )
        .unwrap();

    let err = ledger
        .ingest_scan(&scan_of(0, 0, 10), &[sell(at(1, 64, 1), 2.0)], &[], IngestOptions::default())
        .unwrap_err();
    assert!(matches!(err, LedgerError::ConsistencyViolation(_)));

    let summaries = chunks(&ledger, &ChunkQuery::default());
    assert_eq!(summaries[0].total_scans, 1);
    assert!(ledger
        .shop_history(&at(1, 64, 1))
        .unwrap()
        .iter()
        .all(|s| s.price == 1.0));
}

// ============================================================================
// Journal replay
// ============================================================================

#[test]
fn rebuild_reproduces_active_state() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    ingest(
        &ledger,
        scan_of(0, 0, 0),
        &[sell(at(1, 64, 1), 10.0), sell(at(2, 64, 2), 3.0)],
        &[named_sighting(at(4, 70, 4), "Mill")],
    );
    ingest(&ledger, scan_of(0, 0, 10), &[sell(at(1, 64, 1), 11.0)], &[]);
    ledger
        .ingest_scan(
            &scan_of(3, 3, 20),
            &[],
            &[ui_waystone(at(50, 64, 50), "Hub")],
            IngestOptions {
                skip_shop_reconcile: true,
                ..IngestOptions::default()
            },
        )
        .unwrap();

    let shops_before = active_shops(&ledger);
    let waystones_before = active_waystones(&ledger);

    let report = ledger.rebuild_from_journal().unwrap();
    assert_eq!(report.scans_replayed, 3);
    assert_eq!(report.shop_observations, 3);
    assert_eq!(report.waystone_observations, 2);
    assert_eq!(report.active_shops, shops_before.len());
    assert_eq!(report.active_waystones, waystones_before.len());

    let shops_after = active_shops(&ledger);
    for (before, after) in shops_before.iter().zip(&shops_after) {
        assert_eq!(after.position, before.position);
        assert_eq!(after.price, before.price);
        assert_eq!(after.first_seen_at, before.first_seen_at);
        assert_eq!(after.last_seen_at, before.last_seen_at);
        assert_eq!(
            after.nearest_waystone.as_ref().map(|n| (&n.name, n.distance_sq)),
            before.nearest_waystone.as_ref().map(|n| (&n.name, n.distance_sq))
        );
    }
    let waystones_after = active_waystones(&ledger);
    let summary = |w: &WaystoneState| (w.position, w.name.clone(), w.source, w.last_seen_at);
    assert_eq!(
        waystones_after.iter().map(summary).collect::<Vec<_>>(),
        waystones_before.iter().map(summary).collect::<Vec<_>>()
    );
    assert_eq!(ledger.shop_history(&at(1, 64, 1)).unwrap().len(), 2);
}

// ============================================================================
// Projections
// ============================================================================

#[test]
fn offers_rank_and_deduplicate() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    ingest(
        &ledger,
        scan_of(0, 0, 0),
        &[
            shop(at(1, 64, 1), "alice", "Diamond", 5.0, ShopAction::Sell),
            shop(at(2, 64, 1), "bob", "Diamond", 3.0, ShopAction::Sell),
            shop(at(3, 64, 1), "carol", "Diamond", 8.0, ShopAction::Sell),
            shop(at(4, 64, 1), "dave", "Diamond", 2.0, ShopAction::Buy),
            shop(at(5, 64, 1), "erin", "Diamond", 4.0, ShopAction::Buy),
            shop(at(6, 64, 1), "frank", "apple", 1.0, ShopAction::OutOfStock),
        ],
        &[],
    );
    ingest(
        &ledger,
        scan_of(1, 0, 10),
        &[shop(at(20, 64, 1), "bob", "Diamond", 3.0, ShopAction::Sell)],
        &[],
    );

    let sellers = ledger
        .top_offers(&OfferQuery {
            item: "diamond".to_string(),
            action: ShopAction::Sell,
            dimension: None,
            limit: None,
        })
        .unwrap();
    let ranked: Vec<(&str, f64, i32)> = sellers
        .iter()
        .map(|s| (s.owner.as_str(), s.price, s.position.x))
        .collect();
    assert_eq!(ranked, vec![("bob", 3.0, 20), ("alice", 5.0, 1), ("carol", 8.0, 3)]);

    let book = ledger.offer_book("DIAMOND", None, Some(1)).unwrap();
    assert_eq!(book.sellers.len(), 1);
    assert_eq!(book.buyers[0].owner, "erin");
    assert_eq!(book.refreshed_at, Some(time(10)));

    let err = ledger
        .top_offers(&OfferQuery {
            item: "apple".to_string(),
            action: ShopAction::OutOfStock,
            dimension: None,
            limit: None,
        })
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));

    assert_eq!(ledger.list_items().unwrap(), vec!["apple".to_string(), "Diamond".to_string()]);
}

#[test]
fn chunk_summaries_and_filters() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    ingest(
        &ledger,
        scan_of(0, 0, 0),
        &[sell(at(1, 64, 1), 1.0), sell(at(2, 64, 2), 2.0)],
        &[named_sighting(at(3, 70, 3), "Mill")],
    );
    ingest(&ledger, scan_of(0, 0, 10), &[sell(at(1, 64, 1), 1.0)], &[named_sighting(at(3, 70, 3), "Mill")]);

    let overworld = ChunkQuery {
        dimension: Some(Dimension::Overworld),
        ..ChunkQuery::default()
    };
    let summaries = chunks(&ledger, &overworld);
    assert_eq!(summaries.len(), 1);
    let chunk = &summaries[0];
    assert_eq!(chunk.total_scans, 2);
    assert_eq!(chunk.latest_scanned_at, Some(time(10)));
    assert_eq!(chunk.minutes_since_last_scan, Some(50));
    assert_eq!(chunk.active_shops, 1);
    assert_eq!(chunk.last_observed_shops, 1);
    assert_eq!(chunk.ever_observed_shops, 2);
    assert_eq!(chunk.active_waystones, 1);
    assert_eq!(chunk.last_observed_waystones, 1);
    let end = ChunkQuery {
        dimension: Some(Dimension::End),
        ..ChunkQuery::default()
    };
    assert!(chunks(&ledger, &end).is_empty());

    let filtered = ledger
        .query_active_shops(&ShopFilter {
            owner: Some("ALICE".to_string()),
            chunk: Some(ChunkCoord::new(0, 0)),
            ..ShopFilter::default()
        })
        .unwrap();
    assert_eq!(filtered.len(), 1);

    let chunk_sourced = ledger
        .query_active_waystones(&WaystoneFilter {
            source: Some(WaystoneSource::Chunk),
            ..WaystoneFilter::default()
        })
        .unwrap();
    assert_eq!(chunk_sourced.len(), 1);
}

#[test]
fn chunk_listing_counts_the_journal_and_pages() {
    let ledger = ScanLedger::open_in_memory().unwrap();
    let anonymous = WaystoneObservation::Chunk {
        position: at(4, 70, 4),
        name: None,
        owner: None,
    };
    ingest(
        &ledger,
        scan_of(0, 0, 0),
        &[sell(at(1, 64, 1), 1.0), sell(at(2, 64, 2), 2.0)],
        &[anonymous],
    );
    // The ui waystone lands in chunk (2,0), which is never scanned.
    ingest(
        &ledger,
        scan_of(1, 0, 3_000),
        &[sell(at(17, 64, 1), 1.0)],
        &[ui_waystone(at(40, 64, 0), "Hub")],
    );

    let all = chunks(&ledger, &ChunkQuery::default());
    let order: Vec<(i32, i32)> = all.iter().map(|c| (c.chunk.x, c.chunk.z)).collect();
    assert_eq!(order, vec![(1, 0), (0, 0), (2, 0)]);

    let origin = &all[1];
    assert_eq!(origin.minutes_since_last_scan, Some(50));
    assert_eq!(origin.ever_observed_shops, 2);
    assert_eq!(origin.ever_observed_waystones, 1);
    assert_eq!(origin.active_waystones, 0);
    assert_eq!(origin.last_observed_waystones, 1);

    let unscanned = &all[2];
    assert_eq!(unscanned.total_scans, 0);
    assert_eq!(unscanned.minutes_since_last_scan, None);
    assert_eq!(unscanned.active_waystones, 1);
    assert_eq!(unscanned.ever_observed_waystones, 1);

    let keys = |query: ChunkQuery| -> Vec<(i32, i32)> {
        chunks(&ledger, &query)
            .iter()
            .map(|c| (c.chunk.x, c.chunk.z))
            .collect()
    };
    assert_eq!(
        keys(ChunkQuery {
            stale_minutes: Some(30),
            ..ChunkQuery::default()
        }),
        vec![(0, 0), (2, 0)]
    );
    assert_eq!(
        keys(ChunkQuery {
            min_ever: Some(2),
            ..ChunkQuery::default()
        }),
        vec![(0, 0)]
    );
    assert_eq!(
        keys(ChunkQuery {
            min_ever_waystones: Some(1),
            ..ChunkQuery::default()
        }),
        vec![(0, 0), (2, 0)]
    );
    assert_eq!(
        keys(ChunkQuery {
            has_waystones: Some(false),
            ..ChunkQuery::default()
        }),
        vec![(1, 0)]
    );
    assert_eq!(
        keys(ChunkQuery {
            limit: Some(1),
            offset: 1,
            ..ChunkQuery::default()
        }),
        vec![(0, 0)]
    );
}

// ============================================================================
// File-backed ledger
// ============================================================================

#[test]
fn file_ledger_is_single_writer_and_reopens_readonly() {
    let temp = TempDir::new().unwrap();
    let config = LedgerConfig::at(temp.path().join("data").join("ledger.duckdb"));

    {
        let ledger = ScanLedger::open(config.clone()).unwrap();
        ingest(&ledger, scan_of(0, 0, 0), &[sell(at(1, 64, 1), 7.0)], &[]);

        let second = ScanLedger::open(config.clone());
        assert!(second.is_err(), "second writer must be refused while the first is open");
    }

    let reader = ScanLedger::open_readonly(config.clone()).unwrap();
    let shops = reader.query_active_shops(&ShopFilter::default()).unwrap();
    assert_eq!(shops.len(), 1);
    assert_eq!(shops[0].price, 7.0);

    let err = reader
        .ingest_scan(&scan_of(0, 0, 5), &[], &[], IngestOptions::default())
        .unwrap_err();
    assert!(matches!(err, LedgerError::Storage(_)));
}

#[test]
fn readonly_open_of_missing_ledger_fails() {
    let temp = TempDir::new().unwrap();
    let err = ScanLedger::open_readonly(LedgerConfig::at(temp.path().join("absent.duckdb"))).unwrap_err();
    assert!(matches!(err, LedgerError::Config(_)));
}
