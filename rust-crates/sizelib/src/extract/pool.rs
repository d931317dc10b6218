// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Worker pool for CPU heavy extraction work.

use super::Result;
use rayon::prelude::*;

/// Number of workers to use for `item_count` work items.
pub fn worker_count_for(item_count: usize) -> usize {
    let Ok(parallelism) = std::thread::available_parallelism() else {
        return 1;
    };

    parallelism.get().min(item_count).max(1)
}

/// Runs `func` on every item in a dedicated pool.
///
/// Results are returned in submission order regardless of completion
/// order. The first error aborts the remaining work; partial results are
/// discarded.
pub fn run<T, R, F>(items: Vec<T>, func: F) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R> + Sync + Send,
{
    if items.len() <= 1 {
        return items.into_iter().map(func).collect();
    }

    let workers = worker_count_for(items.len());
    log::debug!("extracting {} inputs using {workers} workers", items.len());

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|idx| format!("extract-{idx}"))
        .build()?;

    pool.install(|| items.into_par_iter().map(&func).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Error;

    #[test]
    fn keeps_order() {
        let items: Vec<u64> = (0..64).collect();
        let out = run(items, |x| {
            // Make later items finish first.
            std::thread::sleep(std::time::Duration::from_micros(64 - x));
            Ok(x * 2)
        })
        .unwrap();
        assert_eq!(out, (0..64).map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn first_error_wins() {
        let out = run(vec![1, 2, 3], |x| match x {
            2 => Err(Error::BadDex("boom")),
            x => Ok(x),
        });
        assert!(matches!(out, Err(Error::BadDex("boom"))));
    }

    #[test]
    fn worker_count() {
        assert_eq!(worker_count_for(0), 1);
        assert_eq!(worker_count_for(1), 1);
        assert!(worker_count_for(1000) >= 1);
    }
}
