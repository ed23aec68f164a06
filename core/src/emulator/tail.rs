use std::sync::Arc;

use futures_util::future::{try_join_all, Either};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tondex_util::sync::rayon_run;
use tondex_util::FastHashMap;
use tycho_types::cell::{Cell, HashBytes};
use tycho_types::models::{Account, StdAddr};

use super::{msg_target, MsgTarget};
use crate::models::{EmulatedAccounts, Trace, TraceNode, TransactionInfo};
use crate::provider::MasterchainBlockDataState;
use crate::vm::{ContractExecutor, EmulatedTransaction, EmulationEnv};
use crate::{IndexerError, Result};

/// Inputs shared by every node of one trace emulation.
pub(crate) struct TraceContext {
    pub mc: MasterchainBlockDataState,
    pub by_in_msg: Arc<FastHashMap<HashBytes, TransactionInfo>>,
    pub executor: Arc<dyn ContractExecutor>,
    pub max_depth: u16,
    pub vm_timeout: Option<std::time::Duration>,
}

/// State shared across the parallel subtree emulations of one trace.
///
/// `accounts` and `actors` are the only legitimately shared structures of
/// an emulation; both live exactly as long as the trace.
struct TraceShared {
    mc: MasterchainBlockDataState,
    env: EmulationEnv,
    executor: Arc<dyn ContractExecutor>,
    vm_timeout: Option<std::time::Duration>,
    accounts: Mutex<EmulatedAccounts>,
    actors: Mutex<FastHashMap<StdAddr, mpsc::UnboundedSender<EmulateRequest>>>,
}

struct EmulateRequest {
    msg_root: Cell,
    depth_left: u16,
    respond: oneshot::Sender<Result<TraceNode>>,
}

/// Builds the trace tree hanging off `root_tx`, emulating every out-msg
/// that was not observed on-chain.
pub(crate) async fn emulate_trace(ctx: TraceContext, root_tx: TransactionInfo) -> Result<Trace> {
    let id = root_tx.initial_msg_hash.ok_or_else(|| {
        IndexerError::Internal(anyhow::anyhow!("trace root has no initial_msg_hash"))
    })?;

    let shared = Arc::new(TraceShared {
        env: EmulationEnv {
            config: ctx.mc.config().clone(),
            libraries: ctx.mc.libraries().clone(),
            now: ctx.mc.gen_utime(),
        },
        mc: ctx.mc.clone(),
        executor: ctx.executor.clone(),
        vm_timeout: ctx.vm_timeout,
        accounts: Mutex::new(EmulatedAccounts::new()),
        actors: Mutex::new(FastHashMap::default()),
    });

    let result = emulate_observed_tx(&ctx, &shared, root_tx).await;

    // Dropping the senders stops the per-account actors.
    shared.actors.lock().clear();

    let root = result?;
    let emulated_accounts = std::mem::take(&mut *shared.accounts.lock());

    Ok(Trace {
        id,
        root,
        emulated_accounts,
        interfaces: FastHashMap::default(),
    })
}

/// Recurses on the out-msgs of an on-chain transaction: observed children
/// keep their on-chain roots, missing ones go through the VM. Sibling
/// subtrees are emulated in parallel and joined; the node completes only
/// when every child completes.
fn emulate_observed_tx<'a>(
    ctx: &'a TraceContext,
    shared: &'a Arc<TraceShared>,
    tx: TransactionInfo,
) -> futures_util::future::BoxFuture<'a, Result<TraceNode>> {
    async move {
        let mut children = Vec::with_capacity(tx.out_msgs.len());
        for out_msg in &tx.out_msgs {
            match msg_target(&out_msg.root)? {
                MsgTarget::ExternalOut => continue,
                MsgTarget::ExternalIn => {
                    tracing::warn!(msg_hash = %out_msg.hash, "out-msg with external-in info");
                    continue;
                }
                MsgTarget::Internal(destination) => {
                    match ctx.by_in_msg.get(&out_msg.hash) {
                        Some(child) => {
                            children.push(Either::Left(emulate_observed_tx(
                                ctx,
                                shared,
                                child.clone(),
                            )));
                        }
                        None => {
                            children.push(Either::Right(request_emulation(
                                shared,
                                destination,
                                out_msg.root.clone(),
                                ctx.max_depth,
                            )));
                        }
                    }
                }
            }
        }

        let children = try_join_all(children).await?;

        Ok(TraceNode {
            node_id: tx.in_msg_hash,
            transaction_root: tx.root,
            account: tx.account,
            lt: tx.lt,
            emulated: false,
            children,
        })
    }
    .boxed()
}

/// Routes an emulation request to the destination account's actor,
/// creating it on first use. One actor per account serializes VM calls so
/// account state mutations compose deterministically.
fn request_emulation(
    shared: &Arc<TraceShared>,
    destination: StdAddr,
    msg_root: Cell,
    depth_left: u16,
) -> impl std::future::Future<Output = Result<TraceNode>> + Send + 'static {
    let (tx, rx) = oneshot::channel();
    {
        let mut actors = shared.actors.lock();
        let sender = actors
            .entry(destination.clone())
            .or_insert_with(|| spawn_account_actor(shared, destination));
        sender
            .send(EmulateRequest {
                msg_root,
                depth_left,
                respond: tx,
            })
            .ok();
    }

    async move {
        rx.await.map_err(|_| {
            IndexerError::Vm("account emulation actor stopped".to_owned())
        })?
    }
}

/// One actor per destination account. The VM call itself runs inside the
/// handler, so calls against one account never interleave; assembling the
/// children is detached so requests from a child back to the same account
/// cannot deadlock the mailbox.
fn spawn_account_actor(
    shared: &Arc<TraceShared>,
    address: StdAddr,
) -> mpsc::UnboundedSender<EmulateRequest> {
    let (tx, mut rx) = mpsc::unbounded_channel::<EmulateRequest>();
    let weak = Arc::downgrade(shared);

    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            let Some(shared) = weak.upgrade() else { break };
            handle_emulate_request(shared, &address, req).await;
        }
    });

    tx
}

async fn handle_emulate_request(shared: Arc<TraceShared>, address: &StdAddr, req: EmulateRequest) {
    if req.depth_left == 0 {
        req.respond
            .send(Err(IndexerError::Vm("trace depth limit exceeded".to_owned())))
            .ok();
        return;
    }

    let account = match current_account_state(&shared, address) {
        Ok(account) => account,
        Err(e) => {
            req.respond.send(Err(e)).ok();
            return;
        }
    };

    let emulated = {
        let vm_call = {
            let shared = shared.clone();
            let msg_root = req.msg_root.clone();
            rayon_run(move || {
                shared
                    .executor
                    .emulate_transaction(&shared.env, account.as_deref(), &msg_root)
            })
        };
        match shared.vm_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, vm_call).await {
                Ok(res) => res,
                Err(_) => Err(IndexerError::Vm("vm call timed out".to_owned())),
            },
            None => vm_call.await,
        }
    };

    match emulated {
        Err(e) => {
            req.respond.send(Err(e)).ok();
        }
        Ok(emulated) => {
            shared
                .accounts
                .lock()
                .entry(address.clone())
                .or_default()
                .push((emulated.lt, emulated.account.clone()));

            let node_id = *req.msg_root.repr_hash();
            let address = address.clone();
            let depth_left = req.depth_left;
            tokio::spawn(async move {
                let node =
                    build_emulated_node(shared, address, node_id, emulated, depth_left).await;
                req.respond.send(node).ok();
            });
        }
    }
}

/// A synthetic transaction gets its children the same way an observed one
/// does, except every hop costs depth.
async fn build_emulated_node(
    shared: Arc<TraceShared>,
    address: StdAddr,
    node_id: HashBytes,
    emulated: EmulatedTransaction,
    depth_left: u16,
) -> Result<TraceNode> {
    let mut children = Vec::with_capacity(emulated.out_msgs.len());
    for out_msg in &emulated.out_msgs {
        match msg_target(out_msg)? {
            MsgTarget::ExternalOut => continue,
            MsgTarget::ExternalIn => continue,
            MsgTarget::Internal(destination) => {
                children.push(request_emulation(
                    &shared,
                    destination,
                    out_msg.clone(),
                    depth_left - 1,
                ));
            }
        }
    }

    let children = try_join_all(children).await?;

    Ok(TraceNode {
        node_id,
        transaction_root: emulated.transaction_root,
        account: address,
        lt: emulated.lt,
        emulated: true,
        children,
    })
}

/// The account as the trace currently sees it: the last VM mutation if
/// there was one, the shard state otherwise. An absent account is simply
/// uninitialized.
fn current_account_state(
    shared: &TraceShared,
    address: &StdAddr,
) -> Result<Option<Box<Account>>> {
    if let Some(mutations) = shared.accounts.lock().get(address) {
        if let Some((_, account)) = mutations.last() {
            return Ok(account.clone());
        }
    }

    let Some(accounts) = shared
        .mc
        .shard_accounts(address.workchain as i32, &address.address)
    else {
        return Ok(None);
    };

    match accounts
        .get(&address.address)
        .map_err(|e| IndexerError::Vm(format!("failed to read shard accounts: {e}")))?
    {
        Some((_, shard_account)) => Ok(shard_account
            .load_account()
            .map_err(|e| IndexerError::Vm(format!("failed to load account: {e}")))?
            .map(Box::new)),
        None => Ok(None),
    }
}
