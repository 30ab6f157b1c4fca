//! エンドツーエンドテスト
//!
//! 実際のオリジンサーバーとディスクストレージを使って、
//! コールドヒット・ウォームヒット・レンジ・シングルフライト・
//! 有効期限・パージの一連のシナリオを検証します。

mod common;

use common::{OriginOptions, TestOrigin};
use kura::{Application, Config, ObjectId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// テスト用のアプリケーションを構築する
///
/// パートサイズ4バイトの単一ゾーンと単一ロケーションを持ちます。
fn build_app(origin_url: &str, zone_dir: &Path) -> Arc<Application> {
    let config: Config = serde_json::from_str(&format!(
        r#"{{
            "cache_zones": [
                {{"id": "default", "path": "{}", "part_size": 4, "storage_objects": 1024}}
            ],
            "upstreams": [
                {{"id": "origin", "addresses": ["{}"]}}
            ],
            "locations": [
                {{"name": "example.com", "cache_zone": "default", "upstream": "origin"}}
            ]
        }}"#,
        zone_dir.display(),
        origin_url
    ))
    .unwrap();
    Application::new(&config).unwrap()
}

/// オブジェクトのディスク上のディレクトリを計算する
fn object_dir(zone_dir: &Path, id: &ObjectId) -> PathBuf {
    let (dir1, dir2) = id.hex_prefixes();
    zone_dir
        .join(id.cache_key())
        .join(dir1)
        .join(dir2)
        .join(id.hex())
}

async fn fetch_body(app: &Application, url: &str, range: Option<(u64, u64)>) -> Vec<u8> {
    let url = Url::parse(url).unwrap();
    let response = app.serve(&url, range).await.unwrap();
    response.read_body().await.unwrap().to_vec()
}

#[tokio::test]
async fn test_cold_hit_persists_parts() {
    // S1: 空のゾーンへの最初のGET
    let origin = TestOrigin::start(
        b"0123456789".to_vec(),
        vec![("Cache-Control".to_string(), "max-age=60".to_string())],
    );
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&origin.url(), dir.path());
    app.wait_for_reload().await;

    let body = fetch_body(&app, "http://example.com/a", None).await;
    assert_eq!(body, b"0123456789");
    assert_eq!(origin.hits(), 1);

    // 永続化は非同期なので少し待つ
    tokio::time::sleep(Duration::from_millis(200)).await;

    // ディスクレイアウト: メタデータ + パート 000000(4B) 000001(4B) 000002(2B)
    let id = ObjectId::new("example.com", "/a");
    let obj_dir = object_dir(dir.path(), &id);
    assert!(obj_dir.join("objID").exists());
    for (name, size) in [("000000", 4), ("000001", 4), ("000002", 2)] {
        let meta = std::fs::metadata(obj_dir.join(name)).unwrap();
        assert_eq!(meta.len(), size, "part {} has wrong size", name);
    }

    assert_eq!(app.zone("default").unwrap().stats().objects, 3);
    app.shutdown();
}

#[tokio::test]
async fn test_warm_hit_serves_from_disk() {
    // S2: 同じリクエストの繰り返しはアップストリームに行かない
    let origin = TestOrigin::start(
        b"0123456789".to_vec(),
        vec![("Cache-Control".to_string(), "max-age=60".to_string())],
    );
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&origin.url(), dir.path());
    app.wait_for_reload().await;

    fetch_body(&app, "http://example.com/a", None).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(origin.hits(), 1);

    let hits_before = app.zone("default").unwrap().stats().hits;
    let body = fetch_body(&app, "http://example.com/a", None).await;
    assert_eq!(body, b"0123456789");

    // アップストリームは呼ばれない
    assert_eq!(origin.hits(), 1);
    // 3パートのヒットが記録される
    let hits_after = app.zone("default").unwrap().stats().hits;
    assert_eq!(hits_after - hits_before, 3);
    app.shutdown();
}

#[tokio::test]
async fn test_range_request_served_from_parts() {
    // S3: Range: bytes=5-8 はパート1と2から組み立てられる
    let origin = TestOrigin::start(
        b"0123456789".to_vec(),
        vec![("Cache-Control".to_string(), "max-age=60".to_string())],
    );
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&origin.url(), dir.path());
    app.wait_for_reload().await;

    fetch_body(&app, "http://example.com/a", None).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let hits_before = origin.hits();

    let body = fetch_body(&app, "http://example.com/a", Some((5, 8))).await;
    assert_eq!(body, b"5678");
    assert_eq!(origin.hits(), hits_before);
    app.shutdown();
}

#[tokio::test]
async fn test_cold_range_request_fetches_aligned_parts() {
    // コールドゾーンへのレンジリクエストはパート境界に揃えて取得する
    let origin = TestOrigin::start(
        b"0123456789".to_vec(),
        vec![("Cache-Control".to_string(), "max-age=60".to_string())],
    );
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&origin.url(), dir.path());
    app.wait_for_reload().await;

    let body = fetch_body(&app, "http://example.com/a", Some((5, 8))).await;
    assert_eq!(body, b"5678");
    assert_eq!(origin.hits(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;

    // パート1と2だけがディスクに存在する
    let id = ObjectId::new("example.com", "/a");
    let obj_dir = object_dir(dir.path(), &id);
    assert!(!obj_dir.join("000000").exists());
    assert!(obj_dir.join("000001").exists());
    assert!(obj_dir.join("000002").exists());
    app.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_coalesce() {
    // S4: 50並列のコールドGETでもアップストリームへは1回
    let origin = TestOrigin::start(
        b"0123456789".to_vec(),
        vec![("Cache-Control".to_string(), "max-age=60".to_string())],
    );
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&origin.url(), dir.path());
    app.wait_for_reload().await;

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let app = Arc::clone(&app);
        tasks.push(tokio::spawn(async move {
            fetch_body(&app, "http://example.com/a", None).await
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap(), b"0123456789");
    }
    assert_eq!(origin.hits(), 1);
    app.shutdown();
}

#[tokio::test]
async fn test_expiry_discards_object() {
    // S5: max-age経過後にスケジューラがオブジェクトを破棄する
    let origin = TestOrigin::start(
        b"0123456789".to_vec(),
        vec![("Cache-Control".to_string(), "max-age=1".to_string())],
    );
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&origin.url(), dir.path());
    app.wait_for_reload().await;

    fetch_body(&app, "http://example.com/a", None).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(app.zone("default").unwrap().stats().objects, 3);

    tokio::time::sleep(Duration::from_secs(3)).await;

    // メタデータも残存パートも消えている
    let id = ObjectId::new("example.com", "/a");
    assert!(!object_dir(dir.path(), &id).exists());
    assert_eq!(app.zone("default").unwrap().stats().objects, 0);
    app.shutdown();
}

#[tokio::test]
async fn test_purge_reports_prior_presence() {
    // S6: パージは1回目true、2回目false
    let origin = TestOrigin::start(
        b"0123456789".to_vec(),
        vec![("Cache-Control".to_string(), "max-age=60".to_string())],
    );
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&origin.url(), dir.path());
    app.wait_for_reload().await;

    fetch_body(&app, "http://example.com/a", None).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let url = "http://example.com/a".to_string();
    let results = app.purge(std::slice::from_ref(&url)).await;
    assert_eq!(results.get(&url), Some(&true));

    let id = ObjectId::new("example.com", "/a");
    assert!(!object_dir(dir.path(), &id).exists());
    assert_eq!(app.zone("default").unwrap().stats().objects, 0);

    let results = app.purge(std::slice::from_ref(&url)).await;
    assert_eq!(results.get(&url), Some(&false));
    app.shutdown();
}

#[tokio::test]
async fn test_no_store_bypasses_cache() {
    // no-storeのレスポンスはディスクに書かれず毎回オリジンへ行く
    let origin = TestOrigin::start(
        b"sensitive".to_vec(),
        vec![("Cache-Control".to_string(), "no-store".to_string())],
    );
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&origin.url(), dir.path());
    app.wait_for_reload().await;

    let first = fetch_body(&app, "http://example.com/secret", None).await;
    assert_eq!(first, b"sensitive");
    let second = fetch_body(&app, "http://example.com/secret", None).await;
    assert_eq!(second, b"sensitive");

    // 発見プローブの後は素通りになり、パートは一切書かれない
    assert!(origin.hits() >= 2);
    let id = ObjectId::new("example.com", "/secret");
    let obj_dir = object_dir(dir.path(), &id);
    assert!(!obj_dir.join("000000").exists());
    assert_eq!(app.zone("default").unwrap().stats().objects, 0);
    app.shutdown();
}

#[tokio::test]
async fn test_restart_reload_recovers_cache() {
    // 再起動後、永続化済みのオブジェクトはオリジンなしで提供できる
    let origin = TestOrigin::start(
        b"0123456789".to_vec(),
        vec![("Cache-Control".to_string(), "max-age=3600".to_string())],
    );
    let dir = tempfile::tempdir().unwrap();

    {
        let app = build_app(&origin.url(), dir.path());
        app.wait_for_reload().await;
        fetch_body(&app, "http://example.com/a", None).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        app.shutdown();
    }
    assert_eq!(origin.hits(), 1);

    // 新しいプロセス相当のアプリケーションを同じディレクトリで起動
    let app = build_app(&origin.url(), dir.path());
    app.wait_for_reload().await;
    assert_eq!(app.zone("default").unwrap().stats().objects, 3);

    let body = fetch_body(&app, "http://example.com/a", None).await;
    assert_eq!(body, b"0123456789");
    assert_eq!(origin.hits(), 1);
    app.shutdown();
}

#[tokio::test]
async fn test_revalidation_304_keeps_parts() {
    // 期限切れメタデータは条件付きプローブで再検証され、
    // 304ならパートを保持したまま有効期限だけが更新される
    let origin = TestOrigin::start_with(
        b"0123456789".to_vec(),
        OriginOptions {
            headers: vec![("Cache-Control".to_string(), "max-age=3600".to_string())],
            etag: Some("\"v1\"".to_string()),
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&origin.url(), dir.path());
    app.wait_for_reload().await;

    fetch_body(&app, "http://example.com/a", None).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(origin.hits(), 1);

    // メタデータを直接期限切れに書き換える（スケジューラが
    // 発火する前の時間切れ状態を再現する）
    let id = ObjectId::new("example.com", "/a");
    let meta_path = object_dir(dir.path(), &id).join("objID");
    let mut meta: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&meta_path).unwrap()).unwrap();
    meta["expires_at"] = serde_json::json!(1);
    std::fs::write(&meta_path, serde_json::to_vec(&meta).unwrap()).unwrap();

    let body = fetch_body(&app, "http://example.com/a", None).await;
    assert_eq!(body, b"0123456789");

    // 条件付きプローブの1回だけ増える（ボディの再取得は無い）
    assert_eq!(origin.hits(), 2);

    // メタデータは新しい有効期限で書き戻されている
    let refreshed: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&meta_path).unwrap()).unwrap();
    assert!(refreshed["expires_at"].as_i64().unwrap() > 1);
    app.shutdown();
}

#[tokio::test]
async fn test_stale_copy_served_on_upstream_error() {
    // 再検証が5xxで失敗した場合は古いコピーで応答する
    let origin = TestOrigin::start(
        b"0123456789".to_vec(),
        vec![("Cache-Control".to_string(), "max-age=3600".to_string())],
    );
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&origin.url(), dir.path());
    app.wait_for_reload().await;

    fetch_body(&app, "http://example.com/a", None).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // メタデータを期限切れにして、オリジンを5xxにする
    let id = ObjectId::new("example.com", "/a");
    let meta_path = object_dir(dir.path(), &id).join("objID");
    let mut meta: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&meta_path).unwrap()).unwrap();
    meta["expires_at"] = serde_json::json!(1);
    std::fs::write(&meta_path, serde_json::to_vec(&meta).unwrap()).unwrap();
    origin.set_status(503);

    let body = fetch_body(&app, "http://example.com/a", None).await;
    assert_eq!(body, b"0123456789");
    app.shutdown();
}

#[tokio::test]
async fn test_error_status_is_not_cached() {
    // 5xxのレスポンスはエラーとして伝播し、何も永続化されない
    let origin = TestOrigin::start(b"".to_vec(), Vec::new());
    origin.set_status(500);

    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&origin.url(), dir.path());
    app.wait_for_reload().await;

    let url = Url::parse("http://example.com/broken").unwrap();
    let result = app.serve(&url, None).await;
    assert!(matches!(result, Err(kura::CacheError::Upstream(500))));

    let id = ObjectId::new("example.com", "/broken");
    assert!(!object_dir(dir.path(), &id).exists());
    app.shutdown();
}

#[tokio::test]
async fn test_stats_surface() {
    let origin = TestOrigin::start(
        b"0123456789".to_vec(),
        vec![("Cache-Control".to_string(), "max-age=60".to_string())],
    );
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&origin.url(), dir.path());
    app.wait_for_reload().await;

    fetch_body(&app, "http://example.com/a", None).await;
    fetch_body(&app, "http://example.com/a", None).await;

    let stats = app.stats();
    assert_eq!(stats.zones.len(), 1);
    let zone = &stats.zones[0];
    assert_eq!(zone.id, "default");
    assert_eq!(zone.objects, 3);
    assert_eq!(zone.size, 12); // 3パート × 4バイト
    assert!(zone.requests > 0);
    assert!(zone.hit_percent > 0.0);
    assert!(!stats.version.is_empty());
    app.shutdown();
}
