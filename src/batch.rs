/// 并发执行一批任务并按下标收集结果
///
/// 所有任务同时启动，全部结束后才返回；结果顺序与输入顺序一致，
/// 与完成先后无关。取消 `cancel` 会让尚未完成的任务以错误结束。
use crate::error::{PhantomError, Result};
use futures::future::join_all;
use std::future::Future;
use tokio_util::sync::CancellationToken;

pub async fn all<T, F>(cancel: &CancellationToken, jobs: Vec<F>) -> Vec<Result<T>>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let handles: Vec<_> = jobs
        .into_iter()
        .map(|job| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(PhantomError::Other(anyhow::anyhow!("batch cancelled"))),
                    result = job => result,
                }
            })
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .map(|joined| match joined {
            Ok(result) => result,
            Err(e) => Err(PhantomError::Other(anyhow::anyhow!("batch task failed: {}", e))),
        })
        .collect()
}
