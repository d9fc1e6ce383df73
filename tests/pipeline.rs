//! End-to-end pipeline tests against a stub tang server.
//!
//! The stub implements the real `/rec` math (Y = [s]X) so the full unseal
//! path runs: blind, POST, unblind, derive the CEK, decrypt, deliver.
//! Envelope construction lives here, independent of the library's own KDF,
//! so the two implementations cross-check each other.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64ct::{Base64UrlUnpadded, Encoding};
use josekit::jwk::Jwk;
use sha2::{Digest, Sha256};

use latchy::{
    diffie_hellman, generate_ephemeral, shared_secret_x, thumbprint, AssetList, AssetProvider,
    AssetSource, BuildOptions, ClevisSource, Composition, Error, FifoProvider, FileProvider,
    TangClient, UnsealPolicy,
};

const PLAINTEXT: &[u8] = b"the quick brown secret";

fn public_part(source: &Jwk) -> Jwk {
    let mut map: serde_json::Map<String, serde_json::Value> = source.clone().into();
    map.remove("d");
    Jwk::from_map(map).unwrap()
}

/// RFC 7518 section 4.6, restated locally so the test does not lean on the
/// implementation under test.
fn concat_kdf(z: &[u8], alg: &str, key_len: usize) -> Vec<u8> {
    let mut other_info = Vec::new();
    for field in [alg.as_bytes(), &[][..], &[][..]] {
        other_info.extend_from_slice(&(field.len() as u32).to_be_bytes());
        other_info.extend_from_slice(field);
    }
    other_info.extend_from_slice(&((key_len as u32) * 8).to_be_bytes());

    let mut derived = Vec::new();
    let mut round = 1u32;
    while derived.len() < key_len {
        let mut hasher = Sha256::new();
        hasher.update(round.to_be_bytes());
        hasher.update(z);
        hasher.update(&other_info);
        derived.extend_from_slice(&hasher.finalize());
        round += 1;
    }
    derived.truncate(key_len);
    derived
}

struct StubTang {
    url: String,
    hits: Arc<AtomicUsize>,
}

/// Serve `/rec` forever: the first `fail_first` requests answer with
/// `fail_status`, the rest do the real recovery math.
fn stub_tang(server_key: Jwk, fail_first: usize, fail_status: u16) -> StubTang {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let body = read_request_body(&mut stream);
            let hit = seen.fetch_add(1, Ordering::SeqCst);

            if hit < fail_first {
                let status = match fail_status {
                    406 => "406 Not Acceptable",
                    418 => "418 I'm a teapot",
                    _ => "500 Internal Server Error",
                };
                let _ = write!(
                    stream,
                    "HTTP/1.1 {status}\r\nContent-Length: 6\r\nConnection: close\r\n\r\ndenied"
                );
                continue;
            }

            let reply = match serde_json::from_slice::<Jwk>(&body)
                .ok()
                .and_then(|x| diffie_hellman(&server_key, &x).ok())
            {
                Some(y) => serde_json::to_string(&y).unwrap(),
                None => String::from("{}"),
            };
            let _ = write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Type: application/jwk+json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reply}",
                reply.len()
            );
        }
    });

    StubTang { url, hits }
}

fn read_request_body(stream: &mut TcpStream) -> Vec<u8> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let Ok(count) = stream.read(&mut chunk) else {
            return Vec::new();
        };
        if count == 0 {
            return Vec::new();
        }
        buffer.extend_from_slice(&chunk[..count]);

        if let Some(split) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buffer[..split]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let body_start = split + 4;
            while buffer.len() < body_start + content_length {
                let Ok(count) = stream.read(&mut chunk) else { break };
                if count == 0 {
                    break;
                }
                buffer.extend_from_slice(&chunk[..count]);
            }
            return buffer[body_start..].to_vec();
        }
    }
}

fn test_client() -> Arc<TangClient> {
    let bundle = tempfile::NamedTempFile::new().unwrap();
    Arc::new(TangClient::with_ca_bundle(
        bundle.path().to_path_buf(),
        Some(Duration::from_secs(5)),
    ))
}

fn fast_policy() -> UnsealPolicy {
    UnsealPolicy {
        request_interval: Duration::from_millis(150),
        give_up: Duration::from_secs(60),
    }
}

fn write_jwe(dir: &tempfile::TempDir, compact: &str) -> PathBuf {
    let path = dir.path().join("input.jwe");
    std::fs::write(&path, format!("{compact}\n")).unwrap();
    path
}

fn wait_until(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Poll a source until it settles, returning its final readiness outcome.
fn settle(source: &ClevisSource, timeout: Duration) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match source.is_ready() {
            Ok(true) => return Ok(()),
            Ok(false) => thread::sleep(Duration::from_millis(20)),
            Err(err) => return Err(err),
        }
    }
    panic!("source never settled");
}

#[test]
fn unseal_happy_path() {
    let server = generate_ephemeral("P-256").unwrap();
    let stub = stub_tang(server.clone(), 0, 0);
    let (compact, _) = provision_with(&stub.url, PLAINTEXT, server);

    let dir = tempfile::tempdir().unwrap();
    let jwe = write_jwe(&dir, &compact);

    let meta = Composition::collect();
    let source = ClevisSource::new(
        Some(&jwe),
        None,
        &meta,
        test_client(),
        fast_policy(),
        false,
        true,
    )
    .unwrap();

    settle(&source, Duration::from_secs(10)).unwrap();
    {
        let guard = source.secret().lock().unwrap();
        assert_eq!(guard.expose(), PLAINTEXT);
    }
    assert!(stub.hits.load(Ordering::SeqCst) >= 1);

    source.destroy();
    let guard = source.secret().lock().unwrap();
    assert!(guard.expose().iter().all(|byte| *byte == 0));
}

/// Like `provision` but binding to an existing server key.
fn provision_with(url: &str, payload: &[u8], server: Jwk) -> (String, Jwk) {
    let client = generate_ephemeral("P-256").unwrap();
    let server_pub = public_part(&server);
    let client_pub = public_part(&client);

    let exchange = diffie_hellman(&client, &server_pub).unwrap();
    let kid = thumbprint(&server_pub).unwrap();

    let header = serde_json::json!({
        "alg": "ECDH-ES",
        "enc": "A256GCM",
        "kid": kid,
        "epk": serde_json::to_value(&client_pub).unwrap(),
        "clevis": {
            "pin": "tang",
            "tang": {
                "url": url,
                "adv": { "keys": [serde_json::to_value(&server_pub).unwrap()] }
            }
        }
    });
    let protected = Base64UrlUnpadded::encode_string(header.to_string().as_bytes());

    let z = shared_secret_x(&exchange).unwrap();
    let cek = concat_kdf(&z, "A256GCM", 32);
    let iv = [3u8; 12];
    let sealed = Aes256Gcm::new_from_slice(&cek)
        .unwrap()
        .encrypt(
            Nonce::<U12>::from_slice(&iv),
            Payload {
                msg: payload,
                aad: protected.as_bytes(),
            },
        )
        .unwrap();
    let (ciphertext, tag) = sealed.split_at(sealed.len() - 16);

    let compact = format!(
        "{protected}..{}.{}.{}",
        Base64UrlUnpadded::encode_string(&iv),
        Base64UrlUnpadded::encode_string(ciphertext),
        Base64UrlUnpadded::encode_string(tag)
    );
    (compact, server)
}

#[test]
fn retry_then_success_after_transient_failures() {
    let server = generate_ephemeral("P-256").unwrap();
    let stub = stub_tang(server.clone(), 2, 500);
    let (compact, _) = provision_with(&stub.url, PLAINTEXT, server);

    let dir = tempfile::tempdir().unwrap();
    let jwe = write_jwe(&dir, &compact);

    let meta = Composition::collect();
    let started = Instant::now();
    let source = ClevisSource::new(
        Some(&jwe),
        None,
        &meta,
        test_client(),
        fast_policy(),
        false,
        true,
    )
    .unwrap();

    settle(&source, Duration::from_secs(10)).unwrap();
    // Two transient failures mean at least two request_interval sleeps
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(stub.hits.load(Ordering::SeqCst), 3);
    assert_eq!(source.secret().lock().unwrap().expose(), PLAINTEXT);
}

#[test]
fn permanent_failure_short_circuits() {
    let server = generate_ephemeral("P-256").unwrap();
    let stub = stub_tang(server.clone(), usize::MAX, 418);
    let (compact, _) = provision_with(&stub.url, PLAINTEXT, server);

    let dir = tempfile::tempdir().unwrap();
    let jwe = write_jwe(&dir, &compact);

    let meta = Composition::collect();
    let source = ClevisSource::new(
        Some(&jwe),
        None,
        &meta,
        test_client(),
        fast_policy(),
        false,
        true,
    )
    .unwrap();

    match settle(&source, Duration::from_secs(10)) {
        Err(Error::PermanentTangFailure(message)) => assert!(message.contains(&stub.url[7..])),
        other => panic!("expected a permanent failure, got {other:?}"),
    }
    // No retries after a permanent answer
    assert_eq!(stub.hits.load(Ordering::SeqCst), 1);
}

#[test]
fn give_up_after_the_deadline() {
    let server = generate_ephemeral("P-256").unwrap();
    let stub = stub_tang(server.clone(), usize::MAX, 500);
    let (compact, _) = provision_with(&stub.url, PLAINTEXT, server);

    let dir = tempfile::tempdir().unwrap();
    let jwe = write_jwe(&dir, &compact);

    let policy = UnsealPolicy {
        request_interval: Duration::from_millis(100),
        give_up: Duration::from_millis(350),
    };
    let meta = Composition::collect();
    let started = Instant::now();
    let source = ClevisSource::new(
        Some(&jwe),
        None,
        &meta,
        test_client(),
        policy,
        false,
        true,
    )
    .unwrap();

    match settle(&source, Duration::from_secs(10)) {
        Err(Error::SourceUnavailable(message)) => assert!(message.contains("gave up")),
        other => panic!("expected to give up, got {other:?}"),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(350));
    assert!(elapsed < Duration::from_secs(5));
}

#[test]
fn cancel_aborts_the_retry_loop() {
    let server = generate_ephemeral("P-256").unwrap();
    let stub = stub_tang(server.clone(), usize::MAX, 500);
    let (compact, _) = provision_with(&stub.url, PLAINTEXT, server);

    let dir = tempfile::tempdir().unwrap();
    let jwe = write_jwe(&dir, &compact);

    let meta = Composition::collect();
    let source = ClevisSource::new(
        Some(&jwe),
        None,
        &meta,
        test_client(),
        UnsealPolicy {
            request_interval: Duration::from_secs(30),
            give_up: Duration::from_secs(300),
        },
        false,
        true,
    )
    .unwrap();

    thread::sleep(Duration::from_millis(100));
    source.cancel();

    let started = Instant::now();
    match settle(&source, Duration::from_secs(10)) {
        Err(Error::SourceUnavailable(_)) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
    // The 30s retry sleep must not run to term
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn full_pipeline_delivers_to_file_and_consumes_it() {
    let server = generate_ephemeral("P-256").unwrap();
    let stub = stub_tang(server.clone(), 0, 0);
    let (compact, _) = provision_with(&stub.url, PLAINTEXT, server);

    let dir = tempfile::tempdir().unwrap();
    let jwe = write_jwe(&dir, &compact);
    let sink = dir.path().join("plain.out");

    let config = latchy::parse_config(&format!(
        r#"{{"secrets":[{{"iMethod":"IFILE","in":{:?},"eMethod":"FILE","out":{:?},"outCount":1}}]}}"#,
        jwe.display().to_string(),
        sink.display().to_string()
    ))
    .unwrap();

    let mut list = AssetList::build(
        &config,
        BuildOptions {
            policy: fast_policy(),
            client: Some(test_client()),
            ..BuildOptions::default()
        },
    )
    .unwrap();
    assert_eq!(list.len(), 1);
    list.start_all().unwrap();

    let consumer_sink = sink.clone();
    let consumer = thread::spawn(move || {
        // Wait for the full plaintext, then read it exactly once
        assert!(wait_until(Duration::from_secs(10), || {
            std::fs::metadata(&consumer_sink)
                .map(|meta| meta.len() as usize == PLAINTEXT.len())
                .unwrap_or(false)
        }));
        thread::sleep(Duration::from_millis(300));
        let content = std::fs::read(&consumer_sink).unwrap();
        assert_eq!(content, PLAINTEXT);
    });

    list.run_to_completion().unwrap();
    consumer.join().unwrap();
    assert!(!sink.exists());
}

#[test]
fn file_sink_is_removed_when_unseal_fails_permanently() {
    let server = generate_ephemeral("P-256").unwrap();
    let stub = stub_tang(server.clone(), usize::MAX, 406);
    let (compact, _) = provision_with(&stub.url, PLAINTEXT, server);

    let dir = tempfile::tempdir().unwrap();
    let jwe = write_jwe(&dir, &compact);
    let sink = dir.path().join("never.out");

    let meta = Composition::collect();
    let source = ClevisSource::new(
        Some(&jwe),
        None,
        &meta,
        test_client(),
        fast_policy(),
        false,
        true,
    )
    .unwrap();

    let mut provider = FileProvider::new(source, &sink, 1);
    provider.start().unwrap();

    assert!(wait_until(Duration::from_secs(10), || provider
        .wait(Duration::from_millis(10))));
    match provider.take_result() {
        Err(Error::PermanentTangFailure(_)) => {}
        other => panic!("expected the tang failure to propagate, got {other:?}"),
    }
    assert!(!sink.exists());
}

#[test]
fn full_pipeline_delivers_through_a_fifo() {
    let server = generate_ephemeral("P-256").unwrap();
    let stub = stub_tang(server.clone(), 0, 0);
    let (compact, _) = provision_with(&stub.url, PLAINTEXT, server);

    let dir = tempfile::tempdir().unwrap();
    let jwe = write_jwe(&dir, &compact);
    let fifo = dir.path().join("plain.fifo");

    let meta = Composition::collect();
    let source = ClevisSource::new(
        Some(&jwe),
        None,
        &meta,
        test_client(),
        fast_policy(),
        false,
        true,
    )
    .unwrap();

    let mut provider =
        FifoProvider::new(source, &fifo).with_stop_delay(Duration::from_millis(50));
    provider.start().unwrap();

    // The reader shows up late, as a real consumer would
    thread::sleep(Duration::from_millis(300));
    let mut content = Vec::new();
    std::fs::File::open(&fifo)
        .unwrap()
        .read_to_end(&mut content)
        .unwrap();
    assert_eq!(content, PLAINTEXT);

    assert!(wait_until(Duration::from_secs(10), || provider
        .wait(Duration::from_millis(10))));
    provider.take_result().unwrap();
    provider.stop();
    // The FIFO outlives us
    assert!(fifo.exists());
}

#[test]
fn dump_mode_builds_no_providers_and_stays_offline() {
    let server = generate_ephemeral("P-256").unwrap();
    let stub = stub_tang(server.clone(), 0, 0);
    let (compact, _) = provision_with(&stub.url, PLAINTEXT, server);

    let dir = tempfile::tempdir().unwrap();
    let jwe = write_jwe(&dir, &compact);

    let config = latchy::parse_config(&format!(
        r#"{{"iMethod":"IFILE","in":{:?}}}"#,
        jwe.display().to_string()
    ))
    .unwrap();

    let mut list = AssetList::build(
        &config,
        BuildOptions {
            dump: true,
            client: Some(test_client()),
            ..BuildOptions::default()
        },
    )
    .unwrap();
    assert!(list.is_empty());
    list.run_to_completion().unwrap();

    // No decryption means no tang traffic at all
    thread::sleep(Duration::from_millis(100));
    assert_eq!(stub.hits.load(Ordering::SeqCst), 0);
}
