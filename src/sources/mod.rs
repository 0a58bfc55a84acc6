//! 内置配置源
//!
//! 包含环境变量、文件、模板包含、Vault、etcd v2，以及启用 `zookeeper`
//! 特性时的 ZooKeeper 配置源。

pub mod envvar;
pub mod etcd2;
pub mod file;
pub mod file_watch;
pub mod include;
pub mod tree;
pub mod vault;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

use crate::error::Result;
use crate::source::{Factories, Factory};
use std::sync::Arc;

/// 注册所有内置配置源工厂
pub fn builtin_factories() -> Result<Factories> {
    #[allow(unused_mut)]
    let mut factories: Vec<Arc<dyn Factory>> = vec![
        Arc::new(envvar::EnvVarFactory),
        Arc::new(file::FileFactory),
        Arc::new(include::IncludeFactory),
        Arc::new(vault::VaultFactory),
        Arc::new(etcd2::Etcd2Factory),
    ];
    #[cfg(feature = "zookeeper")]
    factories.push(Arc::new(zookeeper::ZookeeperFactory));

    Factories::from_factories(factories)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_factory_types() {
        let factories = builtin_factories().unwrap();
        let types = factories.types();
        for expected in ["env", "etcd2", "file", "include", "vault"] {
            assert!(types.contains(&expected), "缺少类型 {expected}");
        }
    }
}
