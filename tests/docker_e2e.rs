//! End-to-end scenarios against a live Docker daemon. Run with
//! `cargo test -- --ignored` on a host with a reachable daemon.

use std::{sync::Arc, time::Duration};

use easycontainers::{
    Container, ContainerSpec, ContainerState, Platform, RemotePath, RuntimeConfig, RuntimeFactory,
};

fn factory() -> RuntimeFactory {
    RuntimeFactory::new(RuntimeConfig::default())
}

// deterministic pseudo-random payload, no external crate needed
fn pseudo_random(len: usize) -> Vec<u8> {
    let mut state = 0x9e3779b97f4a7c15u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

#[tokio::test]
#[ignore = "needs a running Docker daemon"]
async fn service_lifecycle_with_published_port() {
    let spec = ContainerSpec::builder()
        .platform(Platform::Docker)
        .name("easycontainers-e2e-nginx")
        .unwrap()
        .image("nginx:latest")
        .unwrap()
        .exposed_port("http", 80)
        .unwrap()
        .port_mapping(80, 38080)
        .unwrap()
        .ephemeral(true)
        .build()
        .unwrap();

    let factory = factory();
    let container = Container::new(spec);
    let runtime = factory.runtime(container.spec()).await.unwrap();

    runtime.start(&container).await.unwrap();
    assert_eq!(container.state(), ContainerState::Running);
    assert!(container.started_at().is_some());

    // the published port answers within the start budget
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        match tokio::net::TcpStream::connect("127.0.0.1:38080").await {
            Ok(_) => break,
            Err(err) if tokio::time::Instant::now() >= deadline => {
                panic!("port 38080 never became reachable: {err}")
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }

    runtime.stop(&container).await.unwrap();
    // the ephemeral auto-remove may already have advanced the state
    assert!(matches!(
        container.state(),
        ContainerState::Stopped | ContainerState::Deleted
    ));
    runtime.delete(&container, false).await.unwrap();
    assert_eq!(container.state(), ContainerState::Deleted);
}

#[tokio::test]
#[ignore = "needs a running Docker daemon"]
async fn exec_reports_exit_codes_and_separate_stderr() {
    let spec = ContainerSpec::builder()
        .platform(Platform::Docker)
        .name("easycontainers-e2e-exec")
        .unwrap()
        .image("busybox:1.36")
        .unwrap()
        .command("sleep")
        .unwrap()
        .arg("300")
        .ephemeral(true)
        .build()
        .unwrap();

    let factory = factory();
    let container = Container::new(spec);
    let runtime = factory.runtime(container.spec()).await.unwrap();
    runtime.start(&container).await.unwrap();

    let mut sink = tokio::io::sink();
    let ok = runtime
        .execute(
            &container,
            "sh",
            &["-c".to_owned(), "exit 0".to_owned()],
            false,
            None,
            None,
            &mut sink,
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap();
    assert_eq!(ok.exit_code, Some(0));
    assert!(ok.stderr.is_empty());

    let failing = runtime
        .execute(
            &container,
            "sh",
            &["-c".to_owned(), "exit 42".to_owned()],
            false,
            None,
            None,
            &mut sink,
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap();
    assert_eq!(failing.exit_code, Some(42));

    // a too-short budget yields no exit code and leaves the container fine
    let timed_out = runtime
        .execute(
            &container,
            "sleep",
            &["30".to_owned()],
            false,
            None,
            None,
            &mut sink,
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    assert_eq!(timed_out.exit_code, None);
    assert_eq!(container.state(), ContainerState::Running);

    runtime.delete(&container, true).await.unwrap();
}

#[tokio::test]
#[ignore = "needs a running Docker daemon"]
async fn directory_round_trip_preserves_contents() {
    let spec = ContainerSpec::builder()
        .platform(Platform::Docker)
        .name("easycontainers-e2e-dirs")
        .unwrap()
        .image("busybox:1.36")
        .unwrap()
        .command("sleep")
        .unwrap()
        .arg("300")
        .ephemeral(true)
        .build()
        .unwrap();

    let factory = factory();
    let container = Container::new(spec);
    let runtime = factory.runtime(container.spec()).await.unwrap();
    runtime.start(&container).await.unwrap();

    let context = tempfile::tempdir().unwrap();
    std::fs::write(context.path().join("Dockerfile"), "FROM alpine:latest\n").unwrap();
    std::fs::write(
        context.path().join("log_time.sh"),
        "#!/bin/sh\ndate >> /tmp/times.txt\n",
    )
    .unwrap();

    let work = RemotePath::new("/work").unwrap();
    let sent = runtime
        .put_directory(&container, context.path(), &work)
        .await
        .unwrap();
    assert!(sent > 0);

    let out = tempfile::tempdir().unwrap();
    let (parent, files) = runtime
        .get_directory(&container, &work, out.path())
        .await
        .unwrap();
    assert_eq!(parent, out.path());
    let names: Vec<String> = files
        .iter()
        .filter_map(|f| f.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect();
    assert!(names.contains(&"Dockerfile".to_owned()));
    assert!(names.contains(&"log_time.sh".to_owned()));
    for file in &files {
        let relative = file.strip_prefix(out.path().join("work")).unwrap();
        assert_eq!(
            std::fs::read(file).unwrap(),
            std::fs::read(context.path().join(relative)).unwrap(),
        );
    }

    runtime.delete(&container, true).await.unwrap();
}

#[tokio::test]
#[ignore = "needs a running Docker daemon"]
async fn file_round_trip_is_binary_identical() {
    let spec = ContainerSpec::builder()
        .platform(Platform::Docker)
        .name("easycontainers-e2e-files")
        .unwrap()
        .image("busybox:1.36")
        .unwrap()
        .command("sleep")
        .unwrap()
        .arg("300")
        .ephemeral(true)
        .build()
        .unwrap();

    let factory = factory();
    let container = Container::new(spec);
    let runtime = factory.runtime(container.spec()).await.unwrap();
    runtime.start(&container).await.unwrap();

    let payload = pseudo_random(1 << 20);
    let staging = tempfile::tempdir().unwrap();
    let local = staging.path().join("a.bin");
    std::fs::write(&local, &payload).unwrap();

    let tmp = RemotePath::new("/tmp").unwrap();
    let sent = runtime
        .put_file(&container, &local, &tmp, None)
        .await
        .unwrap();
    assert_eq!(sent, payload.len() as u64);

    let fetched = runtime
        .get_file(&container, &tmp, "a.bin", Some(&staging.path().join("b.bin")))
        .await
        .unwrap();
    assert_eq!(std::fs::read(fetched).unwrap(), payload);

    runtime.delete(&container, true).await.unwrap();
}

#[tokio::test]
#[ignore = "needs a running Docker daemon"]
async fn forced_delete_from_running_walks_the_lifecycle() {
    let spec = ContainerSpec::builder()
        .platform(Platform::Docker)
        .name("easycontainers-e2e-force")
        .unwrap()
        .image("busybox:1.36")
        .unwrap()
        .command("sleep")
        .unwrap()
        .arg("300")
        .build()
        .unwrap();

    let factory = factory();
    let container = Container::new(spec);
    let runtime = factory.runtime(container.spec()).await.unwrap();
    runtime.start(&container).await.unwrap();
    assert_eq!(container.state(), ContainerState::Running);

    runtime.delete(&container, true).await.unwrap();
    assert_eq!(container.state(), ContainerState::Deleted);

    // idempotent
    runtime.delete(&container, true).await.unwrap();
    assert_eq!(container.state(), ContainerState::Deleted);
}

#[tokio::test]
#[ignore = "needs a running Docker daemon"]
async fn missing_image_fails_the_container() {
    let spec = ContainerSpec::builder()
        .platform(Platform::Docker)
        .name("easycontainers-e2e-missing")
        .unwrap()
        .image("easycontainers/does-not-exist:v0")
        .unwrap()
        .build()
        .unwrap();

    let factory = factory();
    let container = Container::new(spec);
    let runtime = factory.runtime(container.spec()).await.unwrap();

    let err = runtime.start(&container).await.unwrap_err();
    assert!(!err.is_timeout(), "expected a backend error, got {err}");
    assert_eq!(container.state(), ContainerState::Failed);
    runtime.delete(&container, true).await.unwrap();
}

#[tokio::test]
#[ignore = "needs a running Docker daemon"]
async fn log_lines_arrive_in_order() {
    let lines = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = lines.clone();
    let spec = ContainerSpec::builder()
        .platform(Platform::Docker)
        .name("easycontainers-e2e-logs")
        .unwrap()
        .image("busybox:1.36")
        .unwrap()
        .command("sh")
        .unwrap()
        .args(["-c", "for i in 1 2 3; do echo line-$i; done; sleep 2"])
        .custom_property(easycontainers::NATIVE_ENTRYPOINT_PROPERTY, "true")
        .output_line(Arc::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_owned());
        }))
        .build()
        .unwrap();

    let factory = factory();
    let container = Container::new(spec);
    let runtime = factory.runtime(container.spec()).await.unwrap();
    runtime.start(&container).await.unwrap();
    let exit = runtime
        .wait_for_completion(&container, Some(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(exit, 0);

    let captured = lines.lock().unwrap().clone();
    assert_eq!(captured, vec!["line-1", "line-2", "line-3"]);
    runtime.delete(&container, true).await.unwrap();
}
