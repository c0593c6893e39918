use helmsman::core::downloader::{DownloadManager, is_forbidden_ip};
use helmsman::core::errors::HelmsmanError;
use std::net::IpAddr;
use std::path::PathBuf;
use url::Url;
use uuid::Uuid;

#[test]
fn test_internal_ranges_are_forbidden() {
    for raw in [
        "127.0.0.1",
        "10.0.0.5",
        "192.168.1.1",
        "172.16.3.4",
        "169.254.1.1",
        "0.0.0.0",
        "::1",
        "fe80::1",
        "fc00::1",
        "fd12:3456::1",
    ] {
        let ip: IpAddr = raw.parse().unwrap();
        assert!(is_forbidden_ip(ip), "{raw} should be rejected");
    }
}

#[test]
fn test_public_addresses_are_allowed() {
    for raw in ["1.1.1.1", "93.184.216.34", "2606:4700::1111"] {
        let ip: IpAddr = raw.parse().unwrap();
        assert!(!is_forbidden_ip(ip), "{raw} should be allowed");
    }
}

#[test]
fn test_per_server_download_cap() {
    let manager = DownloadManager::new();
    let server = Uuid::new_v4();
    let url = Url::parse("https://downloads.example.com/pack.zip").unwrap();

    let mut jobs = Vec::new();
    for _ in 0..3 {
        jobs.push(
            manager
                .track(server, PathBuf::from("mods"), url.clone())
                .unwrap(),
        );
    }

    // The fourth concurrent job is refused.
    let err = manager
        .track(server, PathBuf::from("mods"), url.clone())
        .unwrap_err();
    assert!(matches!(err, HelmsmanError::DownloadLimit));

    // Another server has its own budget.
    assert!(manager.track(Uuid::new_v4(), PathBuf::from("mods"), url.clone()).is_ok());

    // Cancelling frees a slot.
    assert!(manager.cancel(jobs[0].uuid));
    assert!(manager.track(server, PathBuf::from("mods"), url).is_ok());
}

#[test]
fn test_tracked_jobs_are_indexed_both_ways() {
    let manager = DownloadManager::new();
    let server = Uuid::new_v4();
    let url = Url::parse("https://downloads.example.com/world.tar.gz").unwrap();

    let job = manager.track(server, PathBuf::from(""), url).unwrap();
    assert_eq!(manager.get(job.uuid).unwrap().uuid, job.uuid);
    assert_eq!(manager.for_server(server).len(), 1);
    assert_eq!(job.progress(), 0.0);

    manager.cancel(job.uuid);
    assert!(manager.get(job.uuid).is_none());
    assert!(manager.for_server(server).is_empty());
}
