//! RestoChat CLI 客户端（测试版）
//!
//! 非交互式 CLI，用于测试和展示会话同步功能
//! 启动时通过命令行参数指定用户和 token，自动连接，展示接收到的事件

use anyhow::Result;
use clap::Parser;
use restochat_sdk_core::im::binder::AutoConfirmer;
use restochat_sdk_core::im::conversation::listener::ConversationListener;
use restochat_sdk_core::im::message::listener::MessageListener;
use restochat_sdk_core::{
    ChatClient, ClientConfig, ConnectionState, ConversationSummary, Message, SyncError,
};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, info, warn};

/// RestoChat CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "restochat-cli")]
#[command(about = "RestoChat CLI 客户端 - 用于测试和展示会话同步", long_about = None)]
struct Args {
    /// 登录用户 ID
    #[arg(short, long)]
    user_id: String,

    /// 认证 token
    #[arg(short, long, default_value = "")]
    token: String,

    /// WebSocket 服务器地址
    #[arg(long, default_value = "ws://127.0.0.1:5000/ws")]
    ws_url: String,

    /// HTTP API 基础地址
    #[arg(long, default_value = "http://127.0.0.1:5000/api")]
    api_url: String,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别（默认: info,restochat_sdk_core=debug）
    #[arg(long, default_value = "info,restochat_sdk_core=debug")]
    log_level: String,

    /// 连接后发送一条消息给该用户
    #[arg(long)]
    send_to: Option<String>,

    /// 发送的文本内容
    #[arg(long, default_value = "hello from restochat-cli")]
    text: String,

    /// 自动确认拉黑 / 取消拉黑
    #[arg(long)]
    yes: bool,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 文件不需要颜色
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
    Ok(())
}

fn describe(conv: &ConversationSummary) -> String {
    let preview = conv.last_message_preview.as_deref().unwrap_or("");
    let preview: String = preview.chars().take(30).collect();
    format!(
        "{} | {} | 未读: {} | 最新: {}",
        conv.display_name,
        if conv.online { "在线" } else { "离线" },
        conv.unread_count,
        preview
    )
}

/// 设置监听器（输出所有接收到的信息）
fn setup_listeners(client: &mut ChatClient, auto_confirm: bool) {
    struct CliConversationListener;
    #[async_trait::async_trait]
    impl ConversationListener for CliConversationListener {
        async fn on_sync_server_start(&self) {
            info!("[CLI/Conversation] 🔄 roster 同步开始");
        }

        async fn on_sync_server_finish(&self) {
            info!("[CLI/Conversation] ✅ roster 同步完成");
        }

        async fn on_sync_server_failed(&self, error: String) {
            error!("[CLI/Conversation] ❌ roster 同步失败: {}", error);
        }

        async fn on_conversation_changed(&self, conversation_list: Vec<ConversationSummary>) {
            info!(
                "[CLI/Conversation] 🔄 会话列表（共 {} 个）",
                conversation_list.len()
            );
            for conv in conversation_list.iter().take(5) {
                info!("[CLI/Conversation]   - {}", describe(conv));
            }
        }

        async fn on_total_unread_message_count_changed(&self, total_unread_count: usize) {
            info!("[CLI/Conversation] 📬 总未读数: {}", total_unread_count);
        }

        async fn on_user_status_changed(&self, user_id: String, online: bool) {
            info!("[CLI/Conversation] 👤 {} 在线状态: {}", user_id, online);
        }

        async fn on_block_status_changed(&self, user_id: String, blocked: bool) {
            info!("[CLI/Conversation] 🚫 {} 拉黑状态: {}", user_id, blocked);
        }

        async fn on_active_conversation_closed(&self, conversation_id: String) {
            warn!("[CLI/Conversation] ⚠️ 当前会话被关闭: {}", conversation_id);
        }
    }
    client.set_conversation_listener(Arc::new(CliConversationListener));

    struct CliMessageListener;
    #[async_trait::async_trait]
    impl MessageListener for CliMessageListener {
        async fn on_recv_new_message(&self, message: Message) {
            info!(
                "[CLI/Message] 📨 收到新消息: from={}, content={:?}, image={:?}",
                message.sender_id, message.content, message.image_url
            );
        }

        async fn on_message_status_changed(&self, message: Message) {
            info!(
                "[CLI/Message] 📮 消息状态: localId={:?}, status={:?}",
                message.local_id, message.status
            );
        }

        async fn on_send_failed(&self, message: Message, error: SyncError) {
            error!(
                "[CLI/Message] ❌ 发送失败: localId={:?}, {}",
                message.local_id, error
            );
        }

        async fn on_msg_deleted(&self, conversation_id: String, message_id: String) {
            info!(
                "[CLI/Message] 🗑️ 消息删除: conversation={}, id={}",
                conversation_id, message_id
            );
        }

        async fn on_recv_c2c_read_receipt(&self, reader_id: String) {
            info!("[CLI/Message] 📖 已读回执: {}", reader_id);
        }

        async fn on_connection_status_changed(&self, connected: bool, message: String) {
            if connected {
                info!("[CLI/Message] 🔗 已连接: {}", message);
            } else {
                error!("[CLI/Message] 🔗 断开连接: {}", message);
            }
        }
    }
    client.set_message_listener(Arc::new(CliMessageListener));

    if auto_confirm {
        client.set_action_confirmer(Arc::new(AutoConfirmer));
    }
}

/// 等待连接建立，超时返回 false
async fn wait_connected(client: &ChatClient, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if client.connection_state() == ConnectionState::Connected {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args.log_level)?;

    info!("[CLI] 🚀 RestoChat CLI 客户端（测试模式）");
    info!("[CLI] 👤 用户ID: {}", args.user_id);
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    let config = ClientConfig::new(args.api_url.clone(), args.ws_url.clone(), args.token.clone());
    let mut client = ChatClient::new(config)?;
    setup_listeners(&mut client, args.yes);

    info!("[CLI] 🔗 正在连接服务器...");
    client.ensure_session(&args.user_id);

    if wait_connected(&client, Duration::from_secs(10)).await {
        info!("[CLI] ✅ 连接成功！");
    } else {
        warn!("[CLI] ⚠️ 10 秒内未能建立连接，后台继续重连");
    }

    if let Some(receiver) = &args.send_to {
        let binder = client.binder()?;
        match binder.send(receiver, Some(args.text.clone()), None).await {
            Ok(message) => info!(
                "[CLI] 📤 已提交发送: localId={:?}, status={:?}",
                message.local_id, message.status
            ),
            Err(e) => error!("[CLI] ❌ 发送失败: {}", e),
        }
    }

    info!("[CLI] 📥 开始监听事件...");
    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        sleep(Duration::from_secs(args.duration)).await;
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        tokio::signal::ctrl_c().await?;
    }

    if let Ok(list) = client.conversations(None) {
        info!("[CLI] 📋 会话列表（共 {} 个）:", list.len());
        for conv in list.iter().take(5) {
            info!("[CLI]   - {}", describe(conv));
        }
    }
    if let Ok(unread) = client.total_unread() {
        info!("[CLI] 📬 总未读数: {}", unread);
    }

    client.sign_out();
    info!("[CLI] 👋 程序退出");
    Ok(())
}
