//! Sink upload throughput: render() on the producer side plus the
//! render-thread pickup, per pixel format.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use immersive_media_bridge::gpu::SoftwareContext;
use immersive_media_bridge::mainloop::MainContext;
use immersive_media_bridge::sink::VideoSink;
use immersive_media_bridge::video::{PixelFormat, VideoBuffer, VideoCaps};

fn upload(c: &mut Criterion) {
    let mut group = c.benchmark_group("sink_upload");

    for (width, height) in [(640, 360), (1920, 1080)] {
        for format in [PixelFormat::Rgba32, PixelFormat::Rgb24, PixelFormat::I420, PixelFormat::Ayuv] {
            let caps = VideoCaps::new(format, width, height);
            group.throughput(Throughput::Bytes(caps.frame_size() as u64));

            let ctx = MainContext::with_manual_clock();
            let sink = VideoSink::new(&ctx, Arc::new(SoftwareContext::new()));
            sink.set_caps(&caps).expect("caps");

            let id = BenchmarkId::new(format!("{:?}", format), format!("{}x{}", width, height));
            group.bench_with_input(id, &caps, |b, caps| {
                b.iter(|| {
                    sink.render(VideoBuffer::zeroed(caps)).expect("render");
                    ctx.run_pending();
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, upload);
criterion_main!(benches);
