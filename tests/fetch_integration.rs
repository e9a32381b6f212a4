mod support;

use std::time::Duration as StdDuration;

use std::sync::Arc;

use anyhow::Result;
use stupamap_core::{MediaServices, blob::MemoryBlobStore, error::MediaError};

use support::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_miss_downloads_then_hit_avoids_upstream() -> Result<()> {
    let server = MockBlobServer::start().await?;
    server.insert("x/abc/photo1.jpg", b"jpeg-bytes");
    let dirs = TestDirs::new()?;
    let settings = default_test_settings(&dirs.cache_dir);
    let services = MediaServices::start_http(&settings).await?;

    let url = server.object_url("x/abc/photo1.jpg");
    let first = services.fetcher().fetch(&url).await?;
    assert_eq!(std::fs::read(&first)?, b"jpeg-bytes");
    assert!(
        first.starts_with(dirs.cache_dir.join("v1").join("photo").join("abc")),
        "unexpected cache path {}",
        first.display()
    );
    assert_eq!(server.gets(), 1, "Should hit upstream once");

    // A rotated download token maps to the same entry.
    let rotated = url.replace("token=t1", "token=t2");
    let second = services.fetcher().fetch(&rotated).await?;
    assert_eq!(first, second);
    assert_eq!(server.gets(), 1, "Second fetch should be served from cache");

    services.shutdown().await;
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fetches_share_one_request() -> Result<()> {
    let server = MockBlobServer::start_with_delay(Some(StdDuration::from_millis(300))).await?;
    server.insert("stupas/s1/videos/17.mp4", &vec![5u8; 256 * 1024]);
    let dirs = TestDirs::new()?;
    let services = MediaServices::start_http(&default_test_settings(&dirs.cache_dir)).await?;
    let url = server.object_url("stupas/s1/videos/17.mp4");

    let fetches = (0..8).map(|_| {
        let fetcher = services.fetcher().clone();
        let url = url.clone();
        tokio::spawn(async move { fetcher.fetch(&url).await })
    });
    let mut paths = Vec::new();
    for joined in futures::future::join_all(fetches).await {
        paths.push(joined??);
    }

    assert_eq!(server.gets(), 1, "Concurrent misses should coalesce");
    assert!(paths.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(std::fs::metadata(&paths[0])?.len(), 256 * 1024);

    services.shutdown().await;
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_success_status_is_download_failure() -> Result<()> {
    let server = MockBlobServer::start().await?;
    server.insert_status("x/abc/gone.jpg", 403);
    let dirs = TestDirs::new()?;
    let services = MediaServices::start_http(&default_test_settings(&dirs.cache_dir)).await?;
    let url = server.object_url("x/abc/gone.jpg");

    let err = services
        .fetcher()
        .fetch(&url)
        .await
        .expect_err("403 should fail");
    assert!(matches!(err, MediaError::DownloadFailed { .. }), "{err}");
    assert!(!err.to_string().contains("token="), "token leaked: {err}");
    assert_eq!(services.fetcher().cached(&url).await?, None);

    let missing = server.object_url("x/abc/never-uploaded.jpg");
    assert!(services.fetcher().fetch(&missing).await.is_err());
    assert_eq!(server.gets(), 2);

    services.shutdown().await;
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_truncated_body_is_never_published() -> Result<()> {
    let server = MockBlobServer::start().await?;
    server.insert_truncated("x/abc/clip.mp4", &vec![1u8; 64 * 1024]);
    let dirs = TestDirs::new()?;
    let services = MediaServices::start_http(&default_test_settings(&dirs.cache_dir)).await?;
    let url = server.object_url("x/abc/clip.mp4");

    let err = services
        .fetcher()
        .fetch(&url)
        .await
        .expect_err("truncated body should fail");
    assert!(matches!(err, MediaError::DownloadFailed { .. }), "{err}");
    assert_eq!(services.fetcher().usage().await?.entries, 0);
    let staging = dirs.cache_dir.join("v1").join(".staging");
    assert_eq!(std::fs::read_dir(staging)?.count(), 0);

    services.shutdown().await;
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_uploaded_media_is_fetchable_under_owner() -> Result<()> {
    let server = MockBlobServer::start().await?;
    let dirs = TestDirs::new()?;
    let mut settings = default_test_settings(&dirs.cache_dir);
    settings.blob_base_url = Some(server.base_url());
    let services = MediaServices::start_http(&settings).await?;

    let file = dirs.write_file("sunrise.png", b"png-bytes")?;
    let url = services.uploader().upload("s42", None, &file).await?;
    assert_eq!(server.puts(), 1);
    assert!(url.as_str().contains("stupas%2Fs42%2Fphotos%2F"), "{url}");

    let path = services.fetcher().fetch(url.as_str()).await?;
    assert_eq!(std::fs::read(&path)?, b"png-bytes");
    assert!(path.starts_with(dirs.cache_dir.join("v1").join("photo").join("s42")));

    assert_eq!(services.fetcher().invalidate_owner("s42").await?, 1);
    assert_eq!(services.fetcher().cached(url.as_str()).await?, None);

    services.shutdown().await;
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_uploads_without_base_url_fail() -> Result<()> {
    let dirs = TestDirs::new()?;
    let services = MediaServices::start_http(&default_test_settings(&dirs.cache_dir)).await?;
    let file = dirs.write_file("a.jpg", b"x")?;

    let err = services
        .uploader()
        .upload("s1", None, &file)
        .await
        .expect_err("no blob base url");
    assert!(matches!(err, MediaError::UploadFailed { .. }), "{err}");

    services.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cache_stays_within_cap_after_downloads() -> Result<()> {
    let server = MockBlobServer::start().await?;
    let dirs = TestDirs::new()?;
    let mut settings = default_test_settings(&dirs.cache_dir);
    settings.cache_max_bytes = 10 * 1024;
    let services = MediaServices::start_http(&settings).await?;

    let names = ["a", "b", "c"];
    for name in names {
        let object = format!("x/abc/{name}.jpg");
        server.insert(&object, &vec![0u8; 4 * 1024]);
        services.fetcher().fetch(&server.object_url(&object)).await?;
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }

    let fetcher = services.fetcher().clone();
    let within_cap = eventually(|| {
        let fetcher = fetcher.clone();
        async move {
            matches!(fetcher.usage().await, Ok(usage) if usage.total_bytes <= 10 * 1024)
        }
    })
    .await;
    assert!(within_cap, "cache never came back under its cap");
    assert_eq!(
        fetcher.cached(&server.object_url("x/abc/a.jpg")).await?,
        None,
        "oldest entry should be evicted first"
    );
    assert!(fetcher.cached(&server.object_url("x/abc/c.jpg")).await?.is_some());

    services.shutdown().await;
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_reuses_cached_media() -> Result<()> {
    let server = MockBlobServer::start().await?;
    server.insert("x/abc/photo1.jpg", b"persisted");
    let dirs = TestDirs::new()?;
    let settings = default_test_settings(&dirs.cache_dir);
    let url = server.object_url("x/abc/photo1.jpg");

    let services = MediaServices::start_http(&settings).await?;
    let first = services.fetcher().fetch(&url).await?;
    services.shutdown().await;

    let services = MediaServices::start_http(&settings).await?;
    let second = services.fetcher().fetch(&url).await?;
    assert_eq!(first, second);
    assert_eq!(server.gets(), 1, "Restart should not refetch cached media");

    services.shutdown().await;
    server.shutdown();
    Ok(())
}

#[test]
fn test_one_shot_fetches_keep_cache_under_cap() -> Result<()> {
    let dirs = TestDirs::new()?;
    let mut settings = default_test_settings(&dirs.cache_dir);
    settings.cache_max_bytes = 10;
    let blobs = Arc::new(MemoryBlobStore::new());

    // Each round mirrors one CLI invocation: fresh runtime, one fetch,
    // shutdown, runtime dropped.
    for round in 0..5 {
        let url = format!("https://store/x%2Fabc%2Fround{round}.jpg");
        blobs.insert(&url, vec![7u8; 8]);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        runtime.block_on(async {
            let services = MediaServices::start(&settings, blobs.clone()).await?;
            services.fetcher().fetch(&url).await?;
            services.shutdown().await;
            anyhow::Ok(())
        })?;
        drop(runtime);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let usage = runtime.block_on(async {
        let services = MediaServices::start(&settings, blobs.clone()).await?;
        let usage = services.fetcher().usage().await?;
        services.shutdown().await;
        anyhow::Ok(usage)
    })?;
    assert_eq!(usage.entries, 1, "only the last fetched entry should remain");
    assert!(usage.total_bytes <= 10, "cache grew to {}", usage.total_bytes);
    Ok(())
}
