use tondex_models::{
    AccountStateKind, AccountUpdate, Block as BlockRow, Message as MessageRow, MessageType,
    ProcessingContext, Transaction as TransactionRow, TransactionMessage, TransactionType,
};
use tycho_types::cell::HashBytes;
use tycho_types::models::{
    AccountStatus, ComputePhase, IntAddr, MsgInfo, PrevBlockRef, StdAddr, TxInfo,
};

use crate::models::{OutMsgInfo, ParsedBlock, TransactionInfo};
use crate::provider::{MasterchainBlockDataState, ShardBlockData};
use crate::{IndexerError, Result};

/// Decodes the masterchain block and the new shard blocks of one seqno into
/// analytical rows and the transaction set used for trace reconstruction.
///
/// The parser is stateless; blocks of a single seqno may be decoded in any
/// order and even in parallel.
pub fn parse_masterchain(mc: &MasterchainBlockDataState) -> Result<ParsedBlock> {
    let mut context = ProcessingContext::default();
    let mut transactions = Vec::new();
    let mut block_count = 0u32;

    let mc_seqno = mc.seqno();

    let mut parse = |data: &ShardBlockData| -> Result<()> {
        let txs = parse_block(data, mc_seqno, &mut context)?;
        transactions.extend(txs);
        block_count += 1;
        Ok(())
    };

    for data in mc.shard_blocks() {
        if data.block_id.is_masterchain() {
            parse(data)?;
        }
    }
    for data in mc.shard_blocks_diff() {
        if !data.block_id.is_masterchain() {
            parse(data)?;
        }
    }

    Ok(ParsedBlock {
        mc_seqno,
        block_count,
        context,
        transactions,
    })
}

fn parse_block(
    data: &ShardBlockData,
    mc_seqno: u32,
    ctx: &mut ProcessingContext,
) -> Result<Vec<TransactionInfo>> {
    let block_id = data.block_id;
    let workchain = block_id.shard.workchain() as i8;

    let info = data.block.load_info().map_err(IndexerError::malformed)?;
    let extra = data.block.load_extra().map_err(IndexerError::malformed)?;

    let prev_info = match info.load_prev_ref().map_err(IndexerError::malformed)? {
        PrevBlockRef::Single(rf) => (rf, None),
        PrevBlockRef::AfterMerge { left, right } => (left, Some(right)),
    };

    let mut transactions = Vec::new();

    let account_blocks = extra
        .account_blocks
        .load()
        .map_err(IndexerError::malformed)?;
    for entry in account_blocks.iter() {
        let (address, _, account_block) = entry.map_err(IndexerError::malformed)?;
        if account_block.account != address {
            return Err(IndexerError::MalformedBlock(anyhow::anyhow!(
                "account block key mismatch for {address}"
            )));
        }

        let account = StdAddr::new(block_id.shard.workchain() as i8, address);
        let mut update = AccountUpdate {
            workchain,
            address,
            last_transaction_time: 0,
            last_transaction_lt: 0,
            state: AccountStateKind::NonExist,
            code_hash: None,
            deleted: false,
        };
        let mut account_tx_count = 0usize;

        for entry in account_block.transactions.iter() {
            let (_, _, tx_cell) = entry.map_err(IndexerError::malformed)?;
            let root = tx_cell.inner().clone();
            let hash = *root.repr_hash();
            let tx = tx_cell.load().map_err(IndexerError::malformed)?;

            let tx_info = tx.load_info().map_err(IndexerError::malformed)?;
            let ordinary = match &tx_info {
                TxInfo::Ordinary(ordinary) => ordinary,
                TxInfo::TickTock(_) => {
                    tracing::warn!(tx_hash = %hash, "skipping non-ordinary transaction");
                    continue;
                }
            };

            let Some(in_msg) = &tx.in_msg else {
                tracing::warn!(tx_hash = %hash, "ordinary transaction without in_msg, skipping");
                continue;
            };
            let in_msg_hash = *in_msg.repr_hash();
            let in_msg_info = in_msg
                .parse::<MsgInfo>()
                .map_err(IndexerError::malformed)?;
            let is_first = matches!(in_msg_info, MsgInfo::ExtIn(_));

            let mut in_value = 0u64;
            process_message(
                ctx,
                &block_id.root_hash,
                &hash,
                &account,
                tx.lt,
                false,
                0,
                in_msg.repr_hash(),
                &in_msg_info,
                Some(&mut in_value),
            );

            let mut out_msgs = Vec::with_capacity(tx.out_msg_count.into_inner() as usize);
            let mut out_value = 0u64;
            for (index, out_msg) in tx.out_msgs.values().enumerate() {
                let out_root = out_msg.map_err(IndexerError::malformed)?;
                let out_info = out_root
                    .parse::<MsgInfo>()
                    .map_err(IndexerError::malformed)?;

                process_message(
                    ctx,
                    &block_id.root_hash,
                    &hash,
                    &account,
                    tx.lt,
                    true,
                    (index + 1) as u16,
                    out_root.repr_hash(),
                    &out_info,
                    Some(&mut out_value),
                );

                out_msgs.push(OutMsgInfo {
                    hash: *out_root.repr_hash(),
                    root: out_root,
                });
            }

            let (exit_code, result_code) = {
                let exit_code = match &ordinary.compute_phase {
                    ComputePhase::Executed(phase) => Some(phase.exit_code),
                    ComputePhase::Skipped(_) => None,
                };
                let result_code = ordinary.action_phase.as_ref().map(|phase| phase.result_code);
                (exit_code, result_code)
            };

            let total_fees = tx.total_fees.tokens.into_inner() as u64;
            ctx.transactions.push(TransactionRow {
                workchain,
                account_id: address,
                lt: tx.lt,
                time: tx.now,
                hash,
                block_shard: block_id.shard.prefix(),
                block_seqno: block_id.seqno,
                block_hash: block_id.root_hash,
                mc_seqno,
                tx_type: TransactionType::Ordinary,
                aborted: ordinary.aborted,
                balance_change: in_value as i64 - out_value as i64 - total_fees as i64,
                exit_code,
                result_code,
            });

            update.last_transaction_time = tx.now;
            update.last_transaction_lt = tx.lt;
            update.state = account_state_kind(tx.end_status);
            update.deleted = tx.end_status == AccountStatus::NotExists;
            account_tx_count += 1;

            transactions.push(TransactionInfo {
                account: account.clone(),
                lt: tx.lt,
                hash,
                root,
                in_msg_hash,
                is_first,
                out_msgs,
                initial_msg_hash: None,
            });
        }

        if account_tx_count > 0 {
            ctx.account_updates.push(update);
        }
    }

    ctx.blocks.push(BlockRow {
        workchain,
        shard: block_id.shard.prefix(),
        seqno: block_id.seqno,
        root_hash: block_id.root_hash,
        file_hash: block_id.file_hash,
        mc_seqno,
        is_key_block: info.key_block,
        transaction_count: transactions.len() as u16,
        gen_utime: info.gen_utime,
        gen_software_version: info.gen_software.version,
        start_lt: info.start_lt,
        end_lt: info.end_lt,
        prev1: prev_info.0.root_hash,
        prev1_seqno: prev_info.0.seqno,
        prev2: prev_info.1.as_ref().map(|rf| rf.root_hash),
        prev2_seqno: prev_info.1.as_ref().map(|rf| rf.seqno),
        prev_key_block: info.prev_key_block_seqno,
    });

    Ok(transactions)
}

#[allow(clippy::too_many_arguments)]
fn process_message(
    ctx: &mut ProcessingContext,
    block_hash: &HashBytes,
    transaction_hash: &HashBytes,
    account: &StdAddr,
    lt: u64,
    is_out: bool,
    index_in_transaction: u16,
    msg_hash: &HashBytes,
    info: &MsgInfo,
    transferred_value: Option<&mut u64>,
) {
    let (src, dst, message_type) = match info {
        MsgInfo::Int(m) => (
            map_addr(&m.src),
            map_addr(&m.dst),
            MessageType::Internal,
        ),
        MsgInfo::ExtIn(m) => ((None, 0), map_addr(&m.dst), MessageType::ExternalIn),
        MsgInfo::ExtOut(m) => (map_addr(&m.src), (None, 0), MessageType::ExternalOut),
    };

    let (value, ihr_fee, fwd_fee, import_fee, created_lt, created_at, bounce, bounced) = match info
    {
        MsgInfo::Int(m) => (
            m.value.tokens.into_inner() as u64,
            m.ihr_fee.into_inner() as u64,
            m.fwd_fee.into_inner() as u64,
            0,
            m.created_lt,
            m.created_at,
            m.bounce,
            m.bounced,
        ),
        MsgInfo::ExtIn(m) => (0, 0, 0, m.import_fee.into_inner() as u64, 0, 0, false, false),
        MsgInfo::ExtOut(m) => (0, 0, 0, 0, m.created_lt, m.created_at, false, false),
    };

    if let Some(acc) = transferred_value {
        *acc += value;
    }

    ctx.messages.push(MessageRow {
        message_hash: *msg_hash,
        src_workchain: src.1,
        src_address: src.0,
        dst_workchain: dst.1,
        dst_address: dst.0,
        message_type,
        message_value: value,
        ihr_fee,
        fwd_fee,
        import_fee,
        created_lt,
        created_at,
        bounce,
        bounced,
    });

    ctx.transaction_messages.push(TransactionMessage {
        transaction_hash: *transaction_hash,
        index_in_transaction,
        is_out,
        transaction_lt: lt,
        transaction_account_workchain: account.workchain,
        transaction_account_address: account.address,
        block_hash: *block_hash,
        message_hash: *msg_hash,
        message_type,
    });
}

fn map_addr(addr: &IntAddr) -> (Option<HashBytes>, i8) {
    match addr {
        IntAddr::Std(addr) => (Some(addr.address), addr.workchain),
        IntAddr::Var(_) => (None, 0),
    }
}

fn account_state_kind(status: AccountStatus) -> AccountStateKind {
    match status {
        AccountStatus::Active => AccountStateKind::Active,
        AccountStatus::Frozen => AccountStateKind::Frozen,
        AccountStatus::Uninit => AccountStateKind::Uninit,
        AccountStatus::NotExists => AccountStateKind::NonExist,
    }
}
