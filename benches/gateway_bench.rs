use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use kiro_gateway::models::claude::ClaudeRequest;
use kiro_gateway::streaming::{EventTranslator, Frame, FrameDecoder};
use kiro_gateway::transform::{ToolSchemaCache, adapt_request, map_model_name};

fn benchmark_frame_decoding(c: &mut Criterion) {
    let mut wire = Vec::new();
    for i in 0..100 {
        let payload = format!(r#"{{"content":"chunk number {i} of the response"}}"#);
        wire.extend_from_slice(&Frame::encode("assistantResponseEvent", payload.as_bytes()));
    }
    wire.extend_from_slice(&Frame::encode(
        "messageStopEvent",
        br#"{"stopReason":"end_turn"}"#,
    ));

    let mut group = c.benchmark_group("frame_decoding");
    group.throughput(Throughput::Bytes(wire.len() as u64));

    group.bench_function("whole_buffer", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            black_box(decoder.feed(&wire).unwrap());
        });
    });

    group.bench_function("small_chunks", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            let mut frames = Vec::new();
            for chunk in wire.chunks(64) {
                frames.extend(decoder.feed(chunk).unwrap());
            }
            black_box(frames);
        });
    });

    group.finish();
}

fn benchmark_translation(c: &mut Criterion) {
    let mut decoder = FrameDecoder::new();
    let mut wire = Vec::new();
    for i in 0..100 {
        let payload = format!(r#"{{"content":"chunk number {i}"}}"#);
        wire.extend_from_slice(&Frame::encode("assistantResponseEvent", payload.as_bytes()));
    }
    let frames = decoder.feed(&wire).unwrap();

    c.bench_function("event_translation", |b| {
        b.iter(|| {
            let mut translator = EventTranslator::new();
            for frame in &frames {
                black_box(translator.translate(frame).unwrap());
            }
        });
    });
}

fn benchmark_model_mapping(c: &mut Criterion) {
    let models = [
        "claude-sonnet-4-20250514",
        "claude-3-7-sonnet-20250219",
        "claude-3-5-haiku-20241022",
        "claude-sonnet-4-5-20250929",
    ];

    c.bench_function("model_name_mapping", |b| {
        b.iter(|| {
            for model in &models {
                black_box(map_model_name(model).unwrap());
            }
        });
    });
}

fn benchmark_request_adaptation(c: &mut Criterion) {
    let req: ClaudeRequest = serde_json::from_value(serde_json::json!({
        "model": "claude-sonnet-4-20250514",
        "max_tokens": 1024,
        "system": "You are a helpful assistant",
        "messages": [
            {"role": "user", "content": "What's the weather in Oslo?"},
            {"role": "assistant", "content": "Let me check."},
            {"role": "user", "content": "Thanks"}
        ],
        "tools": [{
            "name": "get_weather",
            "description": "Fetch a weather report",
            "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}}
        }]
    }))
    .unwrap();
    let cache = ToolSchemaCache::new();

    c.bench_function("request_adaptation", |b| {
        b.iter(|| {
            black_box(adapt_request(&req, &cache).unwrap());
        });
    });
}

criterion_group!(
    benches,
    benchmark_frame_decoding,
    benchmark_translation,
    benchmark_model_mapping,
    benchmark_request_adaptation
);
criterion_main!(benches);
