use std::io::Write;
use std::sync::Arc;

use audioharvest::harvester::{Harvester, HarvesterOptions};
use audioharvest::store::HttpStore;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn zip_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    for (name, data) in members {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn catalog_page(session_hrefs: &[&str]) -> String {
    let rows: String = session_hrefs
        .iter()
        .map(|href| {
            format!(
                r#"<div class="views-row"><div class="un-box"><a href="{}">Session</a></div></div>"#,
                href
            )
        })
        .collect();
    format!("<html><body>{}</body></html>", rows)
}

fn meetings_page(listen_href: &str) -> String {
    format!(
        r#"<html><body>
        <div class="meeting-list-item"><a class="button--alt" href="{}">Listen</a></div>
        </body></html>"#,
        listen_href
    )
}

fn resource_page(download_href: &str, filename: &str) -> String {
    format!(
        r#"<html><body>
        <a id="download-all" href="{}" download="{}">Download all</a>
        <span class="meeting-details--date">2024-05-01</span>
        <span class="meeting-details--time">10.00</span>
        </body></html>"#,
        download_href, filename
    )
}

struct TestRun {
    catalog: MockServer,
    store: MockServer,
    save_dir: tempfile::TempDir,
    ledger_dir: tempfile::TempDir,
}

impl TestRun {
    async fn new() -> Self {
        TestRun {
            catalog: MockServer::start().await,
            store: MockServer::start().await,
            save_dir: tempfile::tempdir().unwrap(),
            ledger_dir: tempfile::tempdir().unwrap(),
        }
    }

    fn harvester(&self, session_workers: usize) -> Harvester {
        let options = HarvesterOptions::default_builder()
            .root_url(format!("{}/clients", self.catalog.uri()))
            .store_endpoint(self.store.uri())
            .store_bucket("recordings")
            .save_dir(self.save_dir.path().to_path_buf())
            .ledger_path(self.ledger_dir.path().join("ledger.jsonl"))
            .session_workers(session_workers)
            .file_workers(4usize)
            .page_attempts(2usize)
            .page_retry_delay_secs(0u64)
            .politeness_delay_ms(0u64)
            .upload_retry_base_ms(5u64)
            .build()
            .unwrap();

        let store = HttpStore::new(&self.store.uri(), "recordings").unwrap();
        Harvester::with_store(options, Arc::new(store)).unwrap()
    }

    /// Mounts one session: catalog row target, its meetings page, the
    /// resource page and the archive bytes.
    async fn mount_session(&self, id: &str, members: &[(&str, &[u8])]) {
        Mock::given(method("GET"))
            .and(path(format!("/clients/{}/meetings", id)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(meetings_page(&format!("/listen/{}", id))),
            )
            .mount(&self.catalog)
            .await;

        Mock::given(method("GET"))
            .and(path(format!("/listen/{}", id)))
            .respond_with(ResponseTemplate::new(200).set_body_string(resource_page(
                &format!("/files/{}.zip", id),
                &format!("{}.zip", id),
            )))
            .mount(&self.catalog)
            .await;

        Mock::given(method("GET"))
            .and(path(format!("/files/{}.zip", id)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(zip_bytes(members)))
            .mount(&self.catalog)
            .await;
    }

    fn ledger_contents(&self) -> String {
        std::fs::read_to_string(self.ledger_dir.path().join("ledger.jsonl")).unwrap_or_default()
    }
}

#[tokio::test]
async fn full_pipeline_uploads_and_reclaims_folders() {
    let run = TestRun::new().await;

    Mock::given(method("GET"))
        .and(path("/clients"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(catalog_page(&["/clients/s1", "/clients/s2"])),
        )
        .mount(&run.catalog)
        .await;

    run.mount_session("s1", &[("ORIGINAL.mp3", b"one"), ("FLOOR.mp3", b"two")])
        .await;
    run.mount_session("s2", &[("ORIGINAL.mp3", b"three")]).await;

    // nothing on the store yet
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&run.store)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&run.store)
        .await;

    let summary = run.harvester(2).run().await.unwrap();

    assert_eq!(summary.uploaded, 3);
    assert_eq!(summary.skipped_duplicates, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.folders_processed, 2);
    assert_eq!(summary.folders_skipped_total(), 0);

    // every extracted folder was reclaimed after its last upload
    let leftovers: Vec<_> = std::fs::read_dir(run.save_dir.path())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(leftovers.is_empty(), "leftover folders: {:?}", leftovers);

    run.store.verify().await;
}

#[tokio::test]
async fn second_run_uploads_nothing() {
    let run = TestRun::new().await;

    Mock::given(method("GET"))
        .and(path("/clients"))
        .respond_with(ResponseTemplate::new(200).set_body_string(catalog_page(&["/clients/s1"])))
        .mount(&run.catalog)
        .await;

    Mock::given(method("GET"))
        .and(path("/clients/s1/meetings"))
        .respond_with(ResponseTemplate::new(200).set_body_string(meetings_page("/listen/s1")))
        .mount(&run.catalog)
        .await;
    Mock::given(method("GET"))
        .and(path("/listen/s1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(resource_page("/files/s1.zip", "s1.zip")),
        )
        .mount(&run.catalog)
        .await;

    // the marker probe finds the folder from the previous run; the archive is
    // never even downloaded
    Mock::given(method("GET"))
        .and(path("/files/s1.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(zip_bytes(&[("ORIGINAL.mp3", b"one")])))
        .expect(0)
        .mount(&run.catalog)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&run.store)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&run.store)
        .await;

    let summary = run.harvester(1).run().await.unwrap();

    assert_eq!(summary.uploaded, 0);
    assert_eq!(summary.folders_processed, 0);
    assert_eq!(summary.folders_skipped.get("already_on_store"), Some(&1));

    run.store.verify().await;
    run.catalog.verify().await;
}

#[tokio::test]
async fn one_broken_session_does_not_stop_the_others() {
    let run = TestRun::new().await;

    let hrefs: Vec<String> = (1..=10).map(|i| format!("/clients/s{}", i)).collect();
    let href_refs: Vec<&str> = hrefs.iter().map(|s| s.as_str()).collect();
    Mock::given(method("GET"))
        .and(path("/clients"))
        .respond_with(ResponseTemplate::new(200).set_body_string(catalog_page(&href_refs)))
        .mount(&run.catalog)
        .await;

    for i in 1..=10 {
        if i == 4 {
            // session 4's pages always fail server-side
            Mock::given(method("GET"))
                .and(path("/clients/s4/meetings"))
                .respond_with(ResponseTemplate::new(500))
                .mount(&run.catalog)
                .await;
            continue;
        }
        run.mount_session(&format!("s{}", i), &[("ORIGINAL.mp3", b"x")])
            .await;
    }

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&run.store)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(9)
        .mount(&run.store)
        .await;

    let summary = run.harvester(3).run().await.unwrap();

    assert_eq!(summary.uploaded, 9);
    assert_eq!(summary.folders_processed, 9);

    // the broken session left an audit trail but no partial work
    let ledger = run.ledger_contents();
    assert!(ledger.contains("AUDIO_LINKS_FAILED"));
    assert!(ledger.contains("/clients/s4/meetings"));

    run.store.verify().await;
}

#[tokio::test]
async fn folder_with_failed_uploads_is_not_a_clean_pass() {
    let run = TestRun::new().await;

    Mock::given(method("GET"))
        .and(path("/clients"))
        .respond_with(ResponseTemplate::new(200).set_body_string(catalog_page(&["/clients/s1"])))
        .mount(&run.catalog)
        .await;
    run.mount_session("s1", &[("ORIGINAL.mp3", b"one")]).await;

    // the store accepts nothing
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&run.store)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&run.store)
        .await;

    let summary = run.harvester(1).run().await.unwrap();

    assert_eq!(summary.uploaded, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.folders_processed, 1);

    let ledger = run.ledger_contents();
    assert!(ledger.contains("\"status\":\"UPLOAD_FAILED\""));
    assert!(!ledger.contains("\"status\":\"SUCCESS\""));
}

#[tokio::test]
async fn unreachable_catalog_root_ends_the_run() {
    let run = TestRun::new().await;

    Mock::given(method("GET"))
        .and(path("/clients"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&run.catalog)
        .await;

    let err = run.harvester(1).run().await.unwrap_err();
    assert!(err.to_string().contains("catalog root unreachable"));
}
