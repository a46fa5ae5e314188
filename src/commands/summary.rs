//! Print positions, trades, PnL, and pyramid sessions

use crate::commands::{CommandError, CommandResult, Outcome};
use paper_trading::store::TradeStatus;

pub fn run(config_path: &str) -> CommandResult {
    let (_config, sot, ts) = crate::commands::open_platform(config_path)?;
    let to_other = |e: paper_trading::CoreError| CommandError::Other(e.into());

    println!("== Positions ==");
    let positions = ts.list_positions().map_err(to_other)?;
    if positions.is_empty() {
        println!("  (none)");
    }
    for pos in &positions {
        println!(
            "  {:<12} qty={} avg={} realized={}",
            pos.symbol.as_str(),
            pos.quantity,
            pos.avg_entry_price,
            pos.realized_pnl
        );
    }

    println!("== Trades ==");
    let trades = ts.list_trades(None).map_err(to_other)?;
    if trades.is_empty() {
        println!("  (none)");
    }
    for trade in &trades {
        let pnl = ts.get_trade_pnl(trade.id).map_err(to_other)?;
        let net = pnl
            .map(|p| p.net_pnl.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  #{:<4} {:<12} {:<7} entry {}@{} exit_qty={} net={}",
            trade.id,
            trade.symbol.as_str(),
            trade.status.as_str(),
            trade.entry_qty,
            trade.entry_price,
            trade.exit_qty,
            net
        );
    }
    let closed = trades
        .iter()
        .filter(|t| t.status == TradeStatus::Closed)
        .count();
    println!(
        "  {} trades total, {} closed, realized PnL {}",
        trades.len(),
        closed,
        ts.get_total_pnl().map_err(to_other)?
    );

    println!("== Pyramid sessions ==");
    let sessions = sot.list_sessions(None).map_err(to_other)?;
    if sessions.is_empty() {
        println!("  (none)");
    }
    for session in &sessions {
        println!(
            "  #{:<4} {:<12} {:<12} wave {}/{} filled={} avg={}{}",
            session.id,
            session.symbol.as_str(),
            session.status.as_str(),
            session.current_wave,
            session.max_waves,
            session.total_filled_qty,
            session.avg_price,
            if session.flagged { " [over budget]" } else { "" }
        );
        for wave in sot.list_waves(session.id).map_err(to_other)? {
            println!(
                "        wave {} {:<10} target {}@{}",
                wave.wave_num,
                wave.status.as_str(),
                wave.target_qty,
                wave.target_price
            );
        }
    }

    println!("== Pending approvals ==");
    let pending = sot
        .list_pending(&paper_trading::store::PendingFilter {
            status: Some(paper_trading::PendingStatus::Pending),
            ..Default::default()
        })
        .map_err(to_other)?;
    if pending.is_empty() {
        println!("  (none)");
    }
    for row in &pending {
        println!(
            "  #{:<4} {:<12} {} {} @ {} [{}]{}",
            row.id,
            row.symbol.as_str(),
            row.side.as_str(),
            row.quantity,
            row.price,
            row.source.as_str(),
            row.risk_note
                .as_deref()
                .map(|n| format!(" !! {n}"))
                .unwrap_or_default()
        );
    }

    Ok(Outcome::Done)
}
