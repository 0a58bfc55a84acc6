//! 解析流程基准测试
//!
//! 测试文档解析、配置源设置加载和引用解析的性能

use config_resolver::document::{parse_document, DocumentFormat};
use config_resolver::resolver::{expand_env_only, Resolver, ResolverOptions};
use config_resolver::source::{settings_from_document, ConfigSource};
use config_resolver::sources::builtin_factories;
use config_resolver::sources::envvar::EnvVarConfigSource;
use criterion::{criterion_group, criterion_main, Criterion};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::hint::black_box;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DOCUMENT: &str = r#"
config_sources:
  env:
    defaults:
      DB_HOST: db.internal
      DB_PORT: "5432"
      REPLICAS: "[a, b, c]"
service:
  name: api
  listen: "0.0.0.0:${env:DB_PORT}"
  database:
    host: $env:DB_HOST
    port: $env:DB_PORT
    dsn: "postgres://${env:DB_HOST}:${env:DB_PORT}/app"
  replicas: $env:REPLICAS
  literal: "$$not-a-reference"
"#;

/// 解析流程基准测试
fn resolve_processing_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let factories = builtin_factories().unwrap();
    let document = parse_document(DOCUMENT, DocumentFormat::Yaml).unwrap();

    c.bench_function("document_parsing", |b| {
        b.iter(|| black_box(parse_document(black_box(DOCUMENT), DocumentFormat::Yaml)))
    });

    c.bench_function("settings_loading", |b| {
        b.iter(|| black_box(settings_from_document(black_box(&document), &factories)))
    });

    let (_, rest) = settings_from_document(&document, &factories).unwrap();

    c.bench_function("env_expansion", |b| {
        let value = Value::Mapping(rest.clone());
        b.iter(|| black_box(expand_env_only(black_box(&value))))
    });

    c.bench_function("reference_resolution", |b| {
        let defaults: Mapping = serde_yaml::from_str(
            "DB_HOST: db.internal\nDB_PORT: \"5432\"\nREPLICAS: \"[a, b, c]\"",
        )
        .unwrap();
        let mut sources: BTreeMap<String, Arc<dyn ConfigSource>> = BTreeMap::new();
        sources.insert("env".to_string(), Arc::new(EnvVarConfigSource::new(defaults)));
        let resolver = Resolver::new(
            sources,
            ResolverOptions::default(),
            CancellationToken::new(),
        );

        b.iter(|| {
            let resolution = runtime
                .block_on(resolver.resolve(black_box(&rest), None))
                .unwrap();
            black_box(resolution.document)
        })
    });
}

criterion_group!(benches, resolve_processing_benchmark);
criterion_main!(benches);
