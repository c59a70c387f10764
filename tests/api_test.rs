// End-to-end checks of the reqwest gateway against a one-shot local HTTP
// server: headers, URL building, error mapping and a short stream session.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use ctw::api::{ApiClient, Gateway, GatewayError, Payload, Query};
use ctw::cancel::CancelToken;
use ctw::config::{Config, StreamSettings};
use ctw::stream::rules::{self, NewRule};
use ctw::stream::{Flow, Includes, StopReason, StreamConsumer, Tweet};

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn read_request(stream: &mut TcpStream) -> io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(String::from_utf8_lossy(&buf).into_owned());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok());
    let chunked = head.contains("transfer-encoding: chunked");
    loop {
        let body = &buf[header_end..];
        let done = match content_length {
            Some(len) => body.len() >= len,
            None if chunked => find(body, b"0\r\n\r\n").is_some(),
            None => true,
        };
        if done {
            break;
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Serve exactly one request with the given answer. Returns the base URL
/// and a receiver for the raw request text.
fn serve_once(status: u16, extra_headers: &str, body: &str) -> (String, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    let response = format!(
        "HTTP/1.1 {status} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n{extra_headers}\r\n{body}",
        body.len()
    );
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let request = read_request(&mut stream).unwrap_or_default();
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
            let _ = tx.send(request);
        }
    });
    (format!("http://{addr}/"), rx)
}

fn client_for(base_url: &str) -> ApiClient {
    let config = Config {
        base_url: base_url.to_string(),
        bearer_token: Some("s3cr3t".into()),
        user_agent: "ctw-test/1.0".into(),
        timeout: Duration::from_secs(5),
        ..Config::default()
    };
    ApiClient::new(&config).unwrap()
}

fn received(rx: &mpsc::Receiver<String>) -> String {
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

#[test]
fn get_sends_auth_agent_and_query() {
    let (base, rx) = serve_once(200, "", r#"{"data":[]}"#);
    let client = client_for(&base);

    let mut query = Query::new();
    query.insert("max_results".into(), "10".into());
    let res = client.get("2/tweets/search/stream/rules", &query).unwrap();
    assert!(res.is_success());

    let request = received(&rx);
    let lower = request.to_ascii_lowercase();
    assert!(
        request.starts_with("GET /2/tweets/search/stream/rules?max_results=10 HTTP/1.1"),
        "{request}"
    );
    assert!(lower.contains("authorization: bearer s3cr3t"), "{request}");
    assert!(lower.contains("user-agent: ctw-test/1.0"), "{request}");
}

#[test]
fn error_answers_become_api_errors_with_rate_limits() {
    let (base, _rx) = serve_once(
        429,
        "x-rate-limit-limit: 50\r\nx-rate-limit-remaining: 0\r\nx-rate-limit-reset: 1700000000\r\n",
        r#"{"errors":[{"code":88,"message":"Rate limit exceeded"}]}"#,
    );
    let client = client_for(&base);

    let err = client
        .get("2/tweets/search/stream", &Query::new())
        .and_then(|res| res.error_for_status())
        .unwrap_err();

    let api = match err {
        GatewayError::Api(api) => api,
        other => panic!("expected an API error, got {other}"),
    };
    assert!(api.is_rate_limited());
    assert_eq!(api.rate_limits.limit, Some(50));
    assert_eq!(api.rate_limits.remaining, Some(0));
    assert_eq!(api.rate_limits.reset, Some(1_700_000_000));
    assert_eq!(
        api.to_string(),
        "twitter api error: status 429; code=88 message=Rate limit exceeded"
    );
}

#[test]
fn delete_uses_the_delete_method() {
    let (base, rx) = serve_once(204, "", "");
    let client = client_for(&base);

    let res = client.delete("2/some/resource", &Query::new()).unwrap();
    assert_eq!(res.status, 204);
    assert!(received(&rx).starts_with("DELETE /2/some/resource HTTP/1.1"));
}

#[test]
fn add_rules_posts_json_with_tags() {
    let (base, rx) = serve_once(
        201,
        "",
        r#"{"data":[{"id":"1","value":"rust lang","tag":"watch_rust_lang"}],"meta":{"summary":{"created":1}}}"#,
    );
    let client = client_for(&base);

    let added = rules::add_rules(&client, &[NewRule::for_keyword("rust lang")], true).unwrap();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].tag.as_deref(), Some("watch_rust_lang"));

    let request = received(&rx);
    assert!(request.starts_with("POST /2/tweets/search/stream/rules?dry_run=true"));
    assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
    assert!(request.contains(r#""tag":"watch_rust_lang""#), "{request}");
}

#[test]
fn multipart_payload_carries_the_chunk() {
    let (base, rx) = serve_once(204, "", "");
    let client = client_for(&base);

    let payload = Payload::Multipart {
        fields: vec![
            ("command".into(), "APPEND".into()),
            ("segment_index".into(), "0".into()),
        ],
        file_field: "media".into(),
        file_name: "chunk".into(),
        bytes: b"BINARYDATA".to_vec(),
    };
    let res = client
        .post(&format!("{base}1.1/media/upload.json"), payload, &Query::new())
        .unwrap();
    assert!(res.is_success());

    let request = received(&rx);
    assert!(request.starts_with("POST /1.1/media/upload.json HTTP/1.1"));
    assert!(request.contains(r#"name="media"; filename="chunk""#), "{request}");
    assert!(request.contains("BINARYDATA"));
    assert!(request.contains("APPEND"));
}

#[test]
fn stream_session_over_http() {
    let feed = "{\"data\":{\"id\":\"1\",\"text\":\"first\"}}\n\r\n{\"data\":[{\"id\":\"2\",\"text\":\"second\"}]}\n";
    let (base, rx) = serve_once(200, "", feed);
    let client = client_for(&base);

    let mut seen = Vec::new();
    let mut handler = |tweet: &Tweet, _: &Includes| -> anyhow::Result<Flow> {
        seen.push(tweet.text.clone());
        Ok(if seen.len() == 2 {
            Flow::Stop
        } else {
            Flow::Continue
        })
    };
    let mut consumer = StreamConsumer::new(&client, &StreamSettings::default(), CancelToken::new());
    let stats = consumer.run(&Query::new(), &mut handler).unwrap();

    assert_eq!(seen, vec!["first", "second"]);
    assert_eq!(stats.stopped_by, StopReason::HandlerStop);
    assert!(received(&rx).starts_with("GET /2/tweets/search/stream HTTP/1.1"));
}

#[test]
fn silent_stream_read_fails_after_the_stall_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let _ = read_request(&mut stream);
            let head = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100000\r\n\r\n";
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(b"\r\n");
            let _ = stream.flush();
            // Keep the socket open without sending anything else.
            thread::sleep(Duration::from_secs(8));
        }
    });

    let config = Config {
        base_url: format!("http://{addr}/"),
        stream: StreamSettings {
            stall_timeout: Duration::from_millis(300),
            ..StreamSettings::default()
        },
        ..Config::default()
    };
    let client = ApiClient::new(&config).unwrap();
    let mut res = client
        .get_streaming("2/tweets/search/stream", &Query::new())
        .unwrap();

    let started = std::time::Instant::now();
    let mut body = Vec::new();
    assert!(res.body.read_to_end(&mut body).is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
}
