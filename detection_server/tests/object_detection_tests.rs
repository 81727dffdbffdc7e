use detection_server::{
    config::SessionConfig,
    server::{AppState, HttpServer},
    telemetry::Metrics,
};
use futures::{SinkExt, StreamExt};
use image::{DynamicImage, ImageBuffer, Rgb};
use object_detection::{DetectedObject, DetectionError, Detector, Objects};
use std::{io::Cursor, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::broadcast,
    time::{sleep, timeout},
};
use tokio_websockets::{ClientBuilder, CloseCode, MaybeTlsStream, Message, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct MockDetector {
    delay: Duration,
}

impl Detector for MockDetector {
    fn predict(&self, image: &DynamicImage) -> Result<Objects, DetectionError> {
        std::thread::sleep(self.delay);
        Ok(Objects {
            objects: vec![
                DetectedObject {
                    bbox: [0.0, 0.0, image.width() as f64, image.height() as f64],
                    label: "person".to_string(),
                },
                DetectedObject {
                    bbox: [4.0, 8.0, 16.0, 24.0],
                    label: "laptop".to_string(),
                },
            ],
        })
    }
}

struct TestServer {
    addr: SocketAddr,
    _shutdown_tx: broadcast::Sender<()>,
}

async fn spawn_server(delay: Duration) -> TestServer {
    let app_state = AppState {
        detector: Arc::new(MockDetector { delay }),
        session_config: SessionConfig::default(),
        metrics: Arc::new(Metrics::new().expect("metrics")),
    };
    let server = HttpServer::new(app_state, "127.0.0.1:0")
        .await
        .expect("bind failed");
    let addr = server.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let _server_handle = server.run(shutdown_rx);

    TestServer {
        addr,
        _shutdown_tx: shutdown_tx,
    }
}

async fn connect(addr: SocketAddr) -> WsClient {
    let uri = format!("ws://{}/object-detection", addr);
    let (client, _) = ClientBuilder::from_uri(uri.parse().unwrap())
        .connect()
        .await
        .expect("connect failed");
    client
}

fn jpeg_frame() -> Vec<u8> {
    let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(64, 48, Rgb([120, 80, 200]));
    let mut image_data: Vec<u8> = Vec::new();
    img.write_to(&mut Cursor::new(&mut image_data), image::ImageFormat::Jpeg)
        .unwrap();
    image_data
}

async fn receive_json(client: &mut WsClient) -> serde_json::Value {
    let message = timeout(Duration::from_secs(3), client.next())
        .await
        .expect("no result in time")
        .expect("stream ended")
        .expect("websocket error");
    assert!(message.is_text());
    serde_json::from_slice(&message.into_payload()).unwrap()
}

async fn receive_close(client: &mut WsClient) -> (CloseCode, String) {
    let message = timeout(Duration::from_secs(3), client.next())
        .await
        .expect("no close in time")
        .expect("stream ended without a close frame")
        .expect("websocket error");
    let (code, reason) = message.as_close().expect("expected a close frame");
    (code, reason.to_string())
}

/// Performs the websocket handshake by hand and returns the raw socket.
async fn raw_upgrade(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /object-detection HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    while !response.windows(4).any(|window| window == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed during handshake");
        response.extend_from_slice(&buf[..n]);
    }
    assert!(response.starts_with(b"HTTP/1.1 101"));
    stream
}

async fn scrape_metrics(addr: SocketAddr) -> String {
    reqwest::get(format!("http://{}/metrics", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap()
}

fn bmp_photo(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut image_data: Vec<u8> = Vec::new();
    img.write_to(&mut Cursor::new(&mut image_data), image::ImageFormat::Bmp)
        .unwrap();
    image_data
}

fn assert_objects_shape(result: &serde_json::Value) {
    let objects = result["objects"].as_array().expect("objects array");
    for object in objects {
        let bbox = object["box"].as_array().expect("box array");
        assert_eq!(bbox.len(), 4);
        assert!(bbox.iter().all(|value| value.is_number()));
        assert!(object["label"].is_string());
    }
}

#[tokio::test]
async fn test_single_detection() {
    let server = spawn_server(Duration::ZERO).await;
    let mut client = connect(server.addr).await;

    client.send(Message::binary(jpeg_frame())).await.unwrap();
    let result = receive_json(&mut client).await;

    assert_objects_shape(&result);
    let objects = result["objects"].as_array().unwrap();
    assert_eq!(objects.len(), 2);
    assert_eq!(objects[0]["label"], "person");
    assert_eq!(objects[0]["box"][2], 64.0);
}

#[tokio::test]
async fn test_backpressure() {
    let server = spawn_server(Duration::from_millis(300)).await;
    let mut client = connect(server.addr).await;

    let frame = jpeg_frame();
    for _ in 0..11 {
        client.send(Message::binary(frame.clone())).await.unwrap();
    }

    let result = receive_json(&mut client).await;
    assert_objects_shape(&result);

    let next = timeout(Duration::from_millis(100), client.next()).await;
    assert!(next.is_err(), "excess frames should have been dropped");
}

#[tokio::test]
async fn test_text_frame_closes_with_internal_error() {
    let server = spawn_server(Duration::ZERO).await;
    let mut client = connect(server.addr).await;

    client
        .send(Message::text("hello".to_string()))
        .await
        .unwrap();

    let (code, reason) = receive_close(&mut client).await;
    assert_eq!(code, CloseCode::INTERNAL_SERVER_ERROR);
    assert!(reason.contains("text"), "unexpected reason: {}", reason);
}

#[tokio::test]
async fn test_undecodable_frame_closes_with_internal_error() {
    let server = spawn_server(Duration::ZERO).await;
    let mut client = connect(server.addr).await;

    client
        .send(Message::binary(b"not an image".to_vec()))
        .await
        .unwrap();

    let (code, reason) = receive_close(&mut client).await;
    assert_eq!(code, CloseCode::INTERNAL_SERVER_ERROR);
    assert!(
        reason.starts_with("Failed to decode frame"),
        "unexpected reason: {}",
        reason
    );
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let server = spawn_server(Duration::ZERO).await;
    let mut failing = connect(server.addr).await;
    let mut healthy = connect(server.addr).await;

    failing
        .send(Message::binary(b"not an image".to_vec()))
        .await
        .unwrap();
    let (code, _) = receive_close(&mut failing).await;
    assert_eq!(code, CloseCode::INTERNAL_SERVER_ERROR);

    healthy.send(Message::binary(jpeg_frame())).await.unwrap();
    let result = receive_json(&mut healthy).await;
    assert_eq!(result["objects"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_dropped_connection_counts_as_disconnect() {
    let server = spawn_server(Duration::ZERO).await;
    let stream = raw_upgrade(server.addr).await;
    drop(stream);

    let mut body = String::new();
    for _ in 0..30 {
        body = scrape_metrics(server.addr).await;
        if body.contains("outcome=\"disconnect\"") {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    assert!(
        body.contains("outcome=\"disconnect\""),
        "session not recorded as disconnect:\n{}",
        body
    );
    assert!(!body.contains("outcome=\"error\""));
}

#[tokio::test]
async fn test_rest_detection() {
    let server = spawn_server(Duration::ZERO).await;
    let form = reqwest::multipart::Form::new().part(
        "image",
        reqwest::multipart::Part::bytes(jpeg_frame()).file_name("frame.jpg"),
    );

    let response = reqwest::Client::new()
        .post(format!("http://{}/object-detection", server.addr))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let result: serde_json::Value = response.json().await.unwrap();
    assert_objects_shape(&result);
    assert_eq!(result["objects"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_rest_missing_image() {
    let server = spawn_server(Duration::ZERO).await;
    let form = reqwest::multipart::Form::new().text("caption", "no image here");

    let response = reqwest::Client::new()
        .post(format!("http://{}/object-detection", server.addr))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_rest_invalid_image() {
    let server = spawn_server(Duration::ZERO).await;
    let form = reqwest::multipart::Form::new().part(
        "image",
        reqwest::multipart::Part::bytes(b"garbage".to_vec()).file_name("frame.jpg"),
    );

    let response = reqwest::Client::new()
        .post(format!("http://{}/object-detection", server.addr))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rest_accepts_large_photo() {
    let server = spawn_server(Duration::ZERO).await;
    // Uncompressed, so well past the default 2 MB request body limit.
    let photo = bmp_photo(1600, 1200);
    assert!(photo.len() > 4 * 1024 * 1024);

    let form = reqwest::multipart::Form::new().part(
        "image",
        reqwest::multipart::Part::bytes(photo).file_name("photo.bmp"),
    );
    let response = reqwest::Client::new()
        .post(format!("http://{}/object-detection", server.addr))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let result: serde_json::Value = response.json().await.unwrap();
    assert_eq!(result["objects"][0]["box"][2], 1600.0);
}

#[tokio::test]
async fn test_health_and_index() {
    let server = spawn_server(Duration::ZERO).await;
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("http://{}/health", server.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "Available");

    let index = client
        .get(format!("http://{}/", server.addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(index.contains("/assets/script.js"));

    let script = client
        .get(format!("http://{}/assets/script.js", server.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(script.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let server = spawn_server(Duration::ZERO).await;
    let mut client = connect(server.addr).await;
    client.send(Message::binary(jpeg_frame())).await.unwrap();
    receive_json(&mut client).await;

    let body = scrape_metrics(server.addr).await;

    assert!(body.contains("frames_received_total"));
    assert!(body.contains("detection_results_sent_total"));
    assert!(!body.contains("_total_total"));
}
