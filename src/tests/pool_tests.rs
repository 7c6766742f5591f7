//! 对象池测试模块
//! 测试取出/归还、容量上限、借用、所有者驱动的自动回收和停止

use super::{eventually, init_logging};
use crate::{ReclaimError, ReclaimingPool};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn manual_pool(max_size: usize) -> ReclaimingPool<Vec<u8>> {
    ReclaimingPool::builder(|| Vec::with_capacity(16))
        .max_size(max_size)
        .partitions(4)
        .background_reclaim(false)
        .build()
        .unwrap()
}

/// 测试1: 池为空时通过工厂新建
#[test]
fn test_take_builds_when_empty() {
    let pool = manual_pool(4);
    let first = pool.take_from_pool();
    let second = pool.take_from_pool();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(pool.created(), 2);
    assert_eq!(pool.available(), 0);
}

/// 测试2: 归还后再次取出得到同一个实例
#[test]
fn test_return_then_take_reuses_instance() {
    let pool = manual_pool(4);
    let object = pool.take_from_pool();
    assert!(pool.return_to_pool(object.clone()));
    assert_eq!(pool.available(), 1);

    let again = pool.take_from_pool();
    assert!(Arc::ptr_eq(&object, &again));
    assert_eq!(pool.created(), 1);
    assert_eq!(pool.available(), 0);
}

/// 测试3: max_size = 2 时归还三个新实例，只保留两个
#[test]
fn test_capacity_bound_scenario() {
    let pool = manual_pool(2);
    let objects: Vec<_> = (0..3).map(|_| pool.take_from_pool()).collect();

    let accepted: Vec<bool> = objects
        .into_iter()
        .map(|object| pool.return_to_pool(object))
        .collect();
    assert_eq!(accepted, vec![true, true, false]);
    assert_eq!(pool.available(), 2);
}

/// 测试4: 空闲实例数量永远不超过 max_size
#[test]
fn test_available_never_exceeds_max_size() {
    let pool = manual_pool(5);
    for _ in 0..20 {
        let object = Arc::new(Vec::new());
        pool.return_to_pool(object);
        assert!(pool.available() <= pool.max_size());
    }
    assert_eq!(pool.available(), 5);
}

/// 测试5: borrow 返回闭包结果并归还实例
#[test]
fn test_borrow_returns_instance() {
    let pool = manual_pool(4);
    let capacity = pool.borrow(|buffer| buffer.capacity());
    assert!(capacity >= 16);
    assert_eq!(pool.available(), 1);

    // 第二次借用复用同一个实例
    pool.borrow(|_| {});
    assert_eq!(pool.created(), 1);
    assert_eq!(pool.available(), 1);
}

/// 测试6: borrow 中的闭包 panic 时实例仍被归还
#[test]
fn test_borrow_returns_instance_on_panic() {
    let pool = manual_pool(4);
    fn failing_task(_: &Arc<Vec<u8>>) {
        panic!("task failed");
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| pool.borrow(failing_task)));
    assert!(result.is_err());
    assert_eq!(pool.available(), 1);
}

/// 测试7: 所有者被 drop 后，后台线程自动回收实例
#[test]
fn test_owner_drop_recycles_in_background() {
    init_logging();
    let pool = ReclaimingPool::builder(|| String::from("pooled"))
        .max_size(8)
        .reclaim_interval(Duration::from_millis(10))
        .build()
        .unwrap();

    let owner = Arc::new(String::from("owner"));
    let object = pool.take_from_pool_owned(&owner);
    assert_eq!(pool.owned(), 1);
    assert!(pool.is_owned(&object));

    drop(owner);
    assert!(eventually(Duration::from_secs(5), || pool.recycled() == 1));
    assert_eq!(pool.owned(), 0);
    assert_eq!(pool.available(), 1);

    let again = pool.take_from_pool();
    assert!(Arc::ptr_eq(&object, &again));
}

/// 测试8: 无后台线程时通过 reclaim_available 回收
#[test]
fn test_reclaim_available_without_background() {
    let pool = manual_pool(4);
    let owner = Arc::new(1u32);
    let object = pool.take_from_pool_owned(&owner);

    // 所有者仍存活，不应回收
    assert_eq!(pool.reclaim_available(), 0);
    assert!(!pool.reclaim_poll());

    drop(owner);
    assert_eq!(pool.reclaim_available(), 1);
    assert_eq!(pool.recycled(), 1);
    assert_eq!(pool.available(), 1);
    assert!(!pool.is_owned(&object));
}

/// 测试9: take_from_pool 会先处理待处理的所有者通知
#[test]
fn test_take_processes_pending_owners() {
    let pool = manual_pool(4);
    let owner = Arc::new(());
    let object = pool.take_from_pool_owned(&owner);
    drop(owner);

    let again = pool.take_from_pool();
    assert!(Arc::ptr_eq(&object, &again));
    assert_eq!(pool.created(), 1);
    assert_eq!(pool.recycled(), 1);
}

/// 测试10: 延迟绑定所有者
#[test]
fn test_lazy_take_binds_later() {
    let pool = manual_pool(4);

    let (object, owner) = pool.lazy_take_from_pool(|object, binding| {
        assert_eq!(pool.owned(), 0);
        let owner = Arc::new(format!("owner of {} bytes", object.capacity()));
        binding.bind(&owner);
        (object, owner)
    });
    assert_eq!(pool.owned(), 1);
    assert!(pool.is_owned(&object));

    drop(owner);
    assert_eq!(pool.reclaim_available(), 1);
    assert_eq!(pool.available(), 1);
}

/// 测试11: 未绑定的延迟取出实例不会被回收
#[test]
fn test_lazy_take_unbound() {
    let pool = manual_pool(4);
    let object = pool.lazy_take_from_pool(|object, binding| {
        drop(binding);
        object
    });
    assert_eq!(pool.owned(), 0);
    assert_eq!(pool.reclaim_available(), 0);
    drop(object);
    assert_eq!(pool.available(), 0);
}

/// 测试12: 显式归还带所有者的实例，之后所有者被 drop 不会重复入池
#[test]
fn test_return_owned_disarms_association() {
    let pool = manual_pool(4);
    let owner = Arc::new(());
    let object = pool.take_from_pool_owned(&owner);

    assert!(pool.return_owned(object.clone()));
    assert_eq!(pool.owned(), 0);
    assert_eq!(pool.available(), 1);

    drop(owner);
    assert_eq!(pool.reclaim_available(), 0);
    assert_eq!(pool.recycled(), 0);
    assert_eq!(pool.available(), 1);
}

/// 测试13: 已被回收的实例再次显式归还时不会重复入池
#[test]
fn test_return_owned_after_reclamation() {
    let pool = manual_pool(4);
    let owner = Arc::new(());
    let object = pool.take_from_pool_owned(&owner);
    drop(owner);
    assert_eq!(pool.reclaim_available(), 1);

    assert!(!pool.return_owned(object));
    assert_eq!(pool.available(), 1);
}

/// 测试14: 停止后池退化为工厂
#[test]
fn test_stop_disables_pool() {
    let pool = manual_pool(4);
    let owner = Arc::new(());
    let _owned = pool.take_from_pool_owned(&owner);
    pool.return_to_pool(pool.take_from_pool());
    assert_eq!(pool.available(), 1);
    assert_eq!(pool.owned(), 1);

    pool.stop();
    assert!(pool.is_stopped());
    assert_eq!(pool.available(), 0);
    assert_eq!(pool.owned(), 0);

    let created = pool.created();
    let fresh = pool.take_from_pool();
    assert_eq!(pool.created(), created + 1);
    assert!(!pool.return_to_pool(fresh));

    // 重复停止是安全的
    pool.stop();
}

/// 测试15: max_size = 0 时池就是普通工厂
#[test]
fn test_zero_capacity_is_plain_factory() {
    let pool = ReclaimingPool::new(0, || 5u8).unwrap();
    let owner = Arc::new(());
    let a = pool.take_from_pool();
    let b = pool.take_from_pool_owned(&owner);
    assert_eq!(pool.created(), 2);
    assert_eq!(pool.owned(), 0);
    assert!(!pool.return_to_pool(a));
    assert!(!pool.return_owned(b));
    assert_eq!(pool.available(), 0);
}

/// 测试16: 在调试构建中归还仍被所有者持有的实例会 panic
#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "still associated")]
fn test_return_of_owned_instance_panics() {
    let pool = manual_pool(4);
    let owner = Arc::new(());
    let object = pool.take_from_pool_owned(&owner);
    pool.return_to_pool(object);
}

/// 测试17: 构建器参数校验
#[test]
fn test_builder_validation() {
    let result = ReclaimingPool::builder(|| 0u8).partitions(0).build();
    assert!(matches!(result, Err(ReclaimError::InvalidPartitionCount)));

    let result = ReclaimingPool::builder(|| 0u8)
        .reclaim_interval(Duration::ZERO)
        .build();
    assert!(matches!(
        result,
        Err(ReclaimError::NonPositiveDuration { .. })
    ));
}

/// 测试18: 多线程并发借用
#[test]
fn test_concurrent_borrow() {
    let built = Arc::new(AtomicUsize::new(0));
    let counter = built.clone();
    let pool = Arc::new(
        ReclaimingPool::builder(move || {
            counter.fetch_add(1, Ordering::Relaxed);
            AtomicUsize::new(0)
        })
        .max_size(16)
        .partitions(8)
        .build()
        .unwrap(),
    );

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    pool.borrow(|uses| uses.fetch_add(1, Ordering::Relaxed));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(pool.available() <= pool.max_size());
    assert!(pool.available() >= 1);
    assert_eq!(pool.created(), built.load(Ordering::Relaxed));

    let total_uses: usize = (0..pool.available())
        .map(|_| pool.take_from_pool().load(Ordering::Relaxed))
        .sum();
    assert!(total_uses <= 8 * 500);
}

/// 测试19: 多个所有者并发 drop，所有实例最终都回到池中
#[test]
fn test_many_owners_dropped_concurrently() {
    let pool = Arc::new(manual_pool(64));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || {
                let owners: Vec<Arc<usize>> = (0..8).map(Arc::new).collect();
                for owner in &owners {
                    let _ = pool.take_from_pool_owned(owner);
                }
                drop(owners);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // 线程之间可能复用彼此已回收的实例，所以只检查没有实例丢失
    pool.reclaim_available();
    assert_eq!(pool.owned(), 0);
    assert!(pool.created() <= 32);
    assert_eq!(pool.available(), pool.created());
}

/// 测试20: 多线程同时归还，空闲实例数量仍不超过 max_size
#[test]
fn test_concurrent_returns_respect_max_size() {
    for _ in 0..50 {
        let pool = Arc::new(manual_pool(2));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let object = Arc::new(Vec::new());
                    barrier.wait();
                    pool.return_to_pool(object)
                })
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|&accepted| accepted)
            .count();

        assert_eq!(accepted, 2);
        assert_eq!(pool.available(), 2);

        // 取出后腾出的空间可以再次使用
        let taken = pool.take_from_pool();
        assert!(pool.return_to_pool(taken));
        assert!(!pool.return_to_pool(Arc::new(Vec::new())));
    }
}

/// 测试21: 与 stop 并发的归还不会在停止后留下空闲实例
#[test]
fn test_returns_racing_stop_leave_pool_empty() {
    for _ in 0..50 {
        let pool = Arc::new(manual_pool(64));
        let barrier = Arc::new(Barrier::new(5));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..16 {
                        pool.return_to_pool(Arc::new(Vec::new()));
                    }
                })
            })
            .collect();
        barrier.wait();
        pool.stop();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(pool.is_stopped());
        assert_eq!(pool.available(), 0);
        assert!(!pool.return_to_pool(Arc::new(Vec::new())));
    }
}

/// 测试22: 有后台线程时 take 不执行回收扫描，只处理已交付的通知
#[test]
fn test_take_leaves_collection_to_background_thread() {
    let pool = ReclaimingPool::builder(|| String::from("pooled"))
        .max_size(4)
        .reclaim_interval(Duration::from_secs(60))
        .build()
        .unwrap();
    // 等待后台线程进入阻塞等待
    thread::sleep(Duration::from_millis(100));

    let owner = Arc::new(());
    let object = pool.take_from_pool_owned(&owner);
    drop(owner);

    let fresh = pool.take_from_pool();
    assert!(!Arc::ptr_eq(&object, &fresh));
    assert_eq!(pool.created(), 2);
    assert_eq!(pool.owned(), 1);

    // 回收扫描把通知交给就绪队列，由调用线程或后台线程之一处理
    pool.reclaim_available();
    assert!(eventually(Duration::from_secs(5), || pool.recycled() == 1));
    let again = pool.take_from_pool();
    assert!(Arc::ptr_eq(&object, &again));
    pool.stop();
}
