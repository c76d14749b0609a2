//! End-to-end protocol tests: a real client executor talking to a real
//! server handler over an in-process loopback service.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body_util::Full;
use prost_reflect::{DescriptorPool, DynamicMessage, MethodDescriptor, ServiceDescriptor, Value};
use prost_types::{
    field_descriptor_proto, DescriptorProto, FieldDescriptorProto, FileDescriptorProto,
    FileDescriptorSet, MethodDescriptorProto, ServiceDescriptorProto,
};
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tower_service::Service;

use http_body_util::BodyExt;
use webgrpc::{trailers, BoxError, Encoding, Frame, GrpcWebClient, GrpcWebHandler, WebBody, WebService};

fn string_message(name: &str, field: &str) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_owned()),
        field: vec![FieldDescriptorProto {
            name: Some(field.to_owned()),
            json_name: Some(field.to_owned()),
            number: Some(1),
            label: Some(field_descriptor_proto::Label::Optional as i32),
            r#type: Some(field_descriptor_proto::Type::String as i32),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn echo_descriptor() -> ServiceDescriptor {
    let file = FileDescriptorProto {
        name: Some("echo.proto".to_owned()),
        package: Some("test".to_owned()),
        syntax: Some("proto3".to_owned()),
        message_type: vec![
            string_message("EchoRequest", "text"),
            string_message("EchoResponse", "text"),
        ],
        service: vec![ServiceDescriptorProto {
            name: Some("Echo".to_owned()),
            method: vec![
                MethodDescriptorProto {
                    name: Some("SayHello".to_owned()),
                    input_type: Some(".test.EchoRequest".to_owned()),
                    output_type: Some(".test.EchoResponse".to_owned()),
                    ..Default::default()
                },
                MethodDescriptorProto {
                    name: Some("RepeatHello".to_owned()),
                    input_type: Some(".test.EchoRequest".to_owned()),
                    output_type: Some(".test.EchoResponse".to_owned()),
                    server_streaming: Some(true),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }],
        ..Default::default()
    };

    let pool = DescriptorPool::from_file_descriptor_set(FileDescriptorSet { file: vec![file] })
        .expect("descriptors are valid");
    pool.get_service_by_name("test.Echo").expect("registered")
}

fn text_of(message: &DynamicMessage) -> String {
    message
        .get_field_by_name("text")
        .unwrap()
        .as_str()
        .unwrap()
        .to_owned()
}

fn reply(descriptor: &ServiceDescriptor, text: &str) -> DynamicMessage {
    let output = descriptor.methods().next().unwrap().output();
    let mut message = DynamicMessage::new(output);
    message.set_field_by_name("text", Value::String(text.to_owned()));
    message
}

/// Stands in for the routing layer: resolves the method from the URL
/// path and hands the request to the handler.
#[derive(Clone)]
struct Loopback {
    handler: GrpcWebHandler,
}

impl Service<Request<Full<Bytes>>> for Loopback {
    type Response = Response<WebBody>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Full<Bytes>>) -> Self::Future {
        let handler = self.handler.clone();
        Box::pin(async move {
            let method = request
                .uri()
                .path()
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_owned();
            Ok(handler.call(&method, request).await)
        })
    }
}

fn echo_web_service() -> WebService {
    let descriptor = echo_descriptor();
    let unary_descriptor = descriptor.clone();
    let streaming_descriptor = descriptor.clone();

    WebService::new(descriptor.clone())
        .unary("say_hello", move |request| {
            let descriptor = unary_descriptor.clone();
            async move {
                let text = text_of(&request);
                if text == "explode" {
                    return Err(Status::invalid_argument("refusing to greet"));
                }
                Ok(reply(&descriptor, &format!("hello {text}")))
            }
        })
        .server_streaming("repeat_hello", move |request| {
            let descriptor = streaming_descriptor.clone();
            async move {
                let text = text_of(&request);
                let items: Vec<Result<DynamicMessage, Status>> = match text.as_str() {
                    "empty" => vec![],
                    "break" => vec![
                        Ok(reply(&descriptor, "m1")),
                        Err(Status::new(Code::DataLoss, "source went away")),
                    ],
                    _ => (1..=3)
                        .map(|i| Ok(reply(&descriptor, &format!("{text} {i}"))))
                        .collect(),
                };
                Ok(tokio_stream::iter(items))
            }
        })
}

fn client() -> GrpcWebClient<Loopback> {
    let handler = GrpcWebHandler::new(echo_web_service());
    GrpcWebClient::new(
        Loopback { handler },
        Uri::from_static("http://loopback.test"),
    )
}

fn request_message(method: &MethodDescriptor, text: &str) -> DynamicMessage {
    let mut message = DynamicMessage::new(method.input());
    message.set_field_by_name("text", Value::String(text.to_owned()));
    message
}

fn unary_method() -> MethodDescriptor {
    echo_descriptor().methods().next().unwrap()
}

fn streaming_method() -> MethodDescriptor {
    echo_descriptor()
        .methods()
        .find(|m| m.is_server_streaming())
        .unwrap()
}

#[tokio::test]
async fn unary_round_trip() {
    let method = unary_method();
    let response = client()
        .unary(&method, request_message(&method, "world"), MetadataMap::new())
        .await
        .unwrap();

    assert_eq!(text_of(&response), "hello world");
}

#[tokio::test]
async fn unary_status_failure_round_trip() {
    let method = unary_method();
    let err = client()
        .unary(
            &method,
            request_message(&method, "explode"),
            MetadataMap::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(err.message(), "refusing to greet");
}

#[tokio::test]
async fn streaming_round_trip_in_order() {
    let method = streaming_method();
    let messages = client()
        .server_streaming(&method, request_message(&method, "msg"), MetadataMap::new())
        .await
        .unwrap();

    let texts: Vec<String> = messages.map(|m| text_of(&m.unwrap())).collect();
    assert_eq!(texts, vec!["msg 1", "msg 2", "msg 3"]);
}

#[tokio::test]
async fn empty_stream_round_trip() {
    let method = streaming_method();
    let mut messages = client()
        .server_streaming(
            &method,
            request_message(&method, "empty"),
            MetadataMap::new(),
        )
        .await
        .unwrap();

    assert!(messages.next().is_none());
}

#[tokio::test]
async fn mid_stream_failure_surfaces_as_the_call_error() {
    // The buffered client reads the whole response before handing out
    // messages, so the error trailer fails the call itself even though
    // one payload frame preceded it on the wire.
    let method = streaming_method();
    let err = client()
        .server_streaming(
            &method,
            request_message(&method, "break"),
            MetadataMap::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::DataLoss);
    assert_eq!(err.message(), "source went away");
}

#[tokio::test]
async fn unknown_method_maps_to_unimplemented() {
    // The bogus router rewrites the path to a method the service does
    // not expose; the handler answers 404 with `X-Cascade: pass`, which
    // the client maps to `Unimplemented`.
    let method = unary_method();
    let mut client = GrpcWebClient::new(
        BogusPath {
            inner: Loopback {
                handler: GrpcWebHandler::new(echo_web_service()),
            },
        },
        Uri::from_static("http://loopback.test"),
    );

    let err = client
        .unary(&method, request_message(&method, "hi"), MetadataMap::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test]
async fn json_mode_round_trip_through_the_handler() {
    let handler = GrpcWebHandler::new(echo_web_service());
    let request = Request::builder()
        .method(http::Method::POST)
        .uri("/test.Echo/SayHello")
        .header(http::header::CONTENT_TYPE, "application/grpc-web+json")
        .body(Full::new(
            Frame::payload(Bytes::from_static(br#"{"text":"json"}"#)).pack(),
        ))
        .unwrap();

    let response = handler.call("SayHello", request).await;

    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(
        response.headers().get(http::header::CONTENT_TYPE).unwrap(),
        "application/grpc-web+json"
    );

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let frames = Frame::unpack(body).unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(&frames[0].body()[..], br#"{"text":"hello json"}"#);
    assert!(trailers::parse_block(frames[1].body()).is_ok());
}

#[tokio::test]
async fn text_mode_streaming_encodes_each_chunk() {
    let handler = GrpcWebHandler::new(echo_web_service());
    let method = streaming_method();
    let mut message = DynamicMessage::new(method.input());
    message.set_field_by_name("text", Value::String("chunk".to_owned()));

    use prost::Message as _;
    let request = Request::builder()
        .method(http::Method::POST)
        .uri("/test.Echo/RepeatHello")
        .header(
            http::header::CONTENT_TYPE,
            "application/grpc-web-text+proto",
        )
        .body(Full::new(Encoding::Base64.encode_blob(
            Frame::payload(message.encode_to_vec()).pack(),
        )))
        .unwrap();

    let response = handler.call("RepeatHello", request).await;
    assert_eq!(response.status(), http::StatusCode::OK);

    // Pull the body chunk by chunk: each one is an independently
    // base64-encoded frame, three payloads then the trailer.
    let mut body = response.into_body();
    let mut frames = Vec::new();
    while let Some(chunk) = body.frame().await {
        let chunk = chunk.unwrap().into_data().unwrap();
        let decoded = Encoding::Base64.decode_blob(chunk).unwrap();
        let mut unpacked = Frame::unpack(decoded).unwrap();
        assert_eq!(unpacked.len(), 1);
        frames.push(unpacked.remove(0));
    }

    assert_eq!(frames.len(), 4);
    assert!(frames[..3].iter().all(|frame| !frame.is_trailer()));
    assert!(frames[3].is_trailer());
    assert!(trailers::parse_block(frames[3].body()).is_ok());
}

/// Rewrites the request path to a method the service does not expose.
struct BogusPath {
    inner: Loopback,
}

impl Service<Request<Full<Bytes>>> for BogusPath {
    type Response = Response<WebBody>;
    type Error = BoxError;
    type Future = <Loopback as Service<Request<Full<Bytes>>>>::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Full<Bytes>>) -> Self::Future {
        *request.uri_mut() = Uri::from_static("http://loopback.test/test.Echo/NoSuchMethod");
        self.inner.call(request)
    }
}
