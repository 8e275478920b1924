/// Benchmarks for the correlation threshold and distribution filters.
use acoustic_views::filters::{filter_indices, threshold_entry, CategoryLookup};
use acoustic_views::models::FilterParams;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{json, Map, Value};

/// A correlation entry over `n` indices with a deterministic spread of coefficients.
fn correlation_entry(n: usize) -> Value {
    let indices: Vec<String> = (0..n).map(|i| format!("I{}", i)).collect();
    let matrix: Vec<Vec<f64>> = (0..n)
        .map(|i| {
            (0..n)
                .map(|j| {
                    if i == j {
                        1.0
                    } else {
                        ((i * 31 + j * 17) % 200) as f64 / 100.0 - 1.0
                    }
                })
                .collect()
        })
        .collect();
    json!({
        "indices": indices,
        "correlation_matrix": matrix,
        "p_values": matrix,
    })
}

/// An index-keyed distributions payload with composite station/bandwidth keys.
fn distributions(indices: usize) -> (Map<String, Value>, CategoryLookup) {
    let mut payload = Map::new();
    let mut categories = Map::new();
    for i in 0..indices {
        let name = format!("I{}", i);
        let mut branches = Map::new();
        for station in ["9M", "14M", "37M"] {
            for bandwidth in ["FullBW", "HighBW"] {
                let bins: Vec<u32> = (0..64).collect();
                branches.insert(format!("{}_{}", station, bandwidth), json!({ "counts": bins }));
            }
        }
        payload.insert(name.clone(), Value::Object(branches));
        let category = if i % 2 == 0 { "complexity" } else { "amplitude" };
        categories.insert(name, json!(category));
    }
    let lookup = CategoryLookup::from_metadata(&json!({ "index_categories": categories }));
    (payload, lookup)
}

fn criterion_benchmark(c: &mut Criterion) {
    for n in [16, 64, 256] {
        let entry = correlation_entry(n);
        for threshold in [0.5, 0.9] {
            let name = format!("threshold_entry({}, {})", n, threshold);
            c.bench_function(&name, |b| {
                b.iter(|| threshold_entry(black_box(&entry), threshold))
            });
        }
    }

    let (payload, lookup) = distributions(60);
    let params = FilterParams {
        category: Some("complexity".to_string()),
        station: Some("9M".to_string()),
        bandwidth: Some("FullBW".to_string()),
        ..Default::default()
    };
    c.bench_function("filter_indices(60)", |b| {
        b.iter(|| filter_indices(black_box(&payload), &lookup, &params))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
