use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use toolrelay::core::cache::{CacheStore, TtlCache};
use toolrelay::mcp::types::{tool_key, ToolDescriptor};

fn make_tools(n: usize) -> Vec<ToolDescriptor> {
    (0..n)
        .map(|i| {
            let name = format!("tool_{i}");
            ToolDescriptor {
                id: tool_key("bench", &name),
                tool_key: tool_key("bench", &name),
                description: Some("lorem ipsum dolor sit amet consectetur adipiscing elit".into()),
                input_schema: Some(serde_json::json!({
                    "type": "object",
                    "properties": { "query": { "type": "string" } }
                })),
                name,
                server_id: "bench".into(),
                server_name: "Bench".into(),
            }
        })
        .collect()
}

fn bench_cache(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");

    for &count in &[10usize, 200usize] {
        let tools = make_tools(count);
        let store = Arc::new(CacheStore::new());
        let cache: TtlCache<String, Vec<ToolDescriptor>> = TtlCache::new(
            Arc::clone(&store),
            Duration::from_secs(300),
            |fingerprint: &String| format!("mcp:list_tools:{fingerprint}"),
            "bench",
        );
        let key = "fingerprint".to_string();
        runtime
            .block_on(cache.get_or_compute(&key, || async {
                Ok::<_, String>(tools.clone())
            }))
            .expect("warm cache");

        let mut group = c.benchmark_group(format!("tool_list_cache_{count}"));
        group.throughput(Throughput::Elements(count as u64));

        group.bench_function(BenchmarkId::new("hit", count), |b| {
            b.iter(|| {
                runtime.block_on(cache.get_or_compute(&key, || async {
                    Ok::<_, String>(Vec::new())
                }))
            })
        });
        group.bench_function(BenchmarkId::new("store_get", count), |b| {
            b.iter(|| store.get::<Vec<ToolDescriptor>>("mcp:list_tools:fingerprint"))
        });
        group.bench_function(BenchmarkId::new("miss_after_reset", count), |b| {
            b.iter(|| {
                cache.reset(&key);
                runtime.block_on(cache.get_or_compute(&key, || async {
                    Ok::<_, String>(tools.clone())
                }))
            })
        });

        group.finish();
    }
}

criterion_group!(benches, bench_cache);
criterion_main!(benches);
