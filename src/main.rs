use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use orderflow::application::producer::{OrderProducer, sample_orders};
use orderflow::application::router::{PipelineRouter, declare_topology};
use orderflow::config::PipelineConfig;
use orderflow::domain::order::Order;
use orderflow::domain::ports::{GatewayRef, QueueGateway};
use orderflow::domain::queue::QueueName;
use orderflow::error::PipelineError;
use orderflow::infrastructure::in_memory::InMemoryBroker;
use orderflow::infrastructure::payment::SimulatedPaymentGateway;
use orderflow::interfaces::json::order_reader::OrderReader;
use orderflow::telemetry;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(author, version, about = "Message-driven order fulfillment pipeline", long_about = None)]
struct Cli {
    /// Directory where persistent messages are kept between runs.
    #[arg(long, global = true, env = "ORDERFLOW_SPOOL_DIR")]
    spool_dir: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true, env = "ORDERFLOW_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish orders to the order queue, then exit
    Producer(ProducerArgs),
    /// Run the order and payment consumers until Ctrl-C
    Consumer(ConsumerArgs),
    /// Publish orders and run the consumers until every order has been processed
    Demo {
        #[command(flatten)]
        producer: ProducerArgs,
        #[command(flatten)]
        consumer: ConsumerArgs,
    },
}

#[derive(Args)]
struct ProducerArgs {
    /// File of JSON orders, one per line. The sample orders are used when absent.
    #[arg(long)]
    orders: Option<PathBuf>,

    /// Pause between publishes, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

#[derive(Args)]
struct ConsumerArgs {
    /// Unacknowledged deliveries allowed per consumer.
    #[arg(long, default_value_t = 1, env = "ORDERFLOW_PREFETCH")]
    prefetch: u16,

    /// Deliveries a malformed message gets before it is dead-lettered (0 = never).
    #[arg(long, default_value_t = 5, env = "ORDERFLOW_MAX_DELIVERIES")]
    max_deliveries: u32,

    /// Simulated order validation time, in milliseconds.
    #[arg(long, default_value_t = 1000, env = "ORDERFLOW_VALIDATION_LATENCY_MS")]
    validation_latency_ms: u64,

    /// Simulated payment processor time, in milliseconds.
    #[arg(long, default_value_t = 2000, env = "ORDERFLOW_PAYMENT_LATENCY_MS")]
    payment_latency_ms: u64,

    /// Share of payments the simulated processor approves.
    #[arg(long, default_value_t = 0.9, env = "ORDERFLOW_SUCCESS_RATE")]
    success_rate: f64,

    /// Seed for the simulated processor.
    #[arg(long, env = "ORDERFLOW_SEED")]
    seed: Option<u64>,
}

impl ConsumerArgs {
    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            prefetch: self.prefetch,
            max_deliveries: (self.max_deliveries > 0).then_some(self.max_deliveries),
            validation_latency: Duration::from_millis(self.validation_latency_ms),
            payment_latency: Duration::from_millis(self.payment_latency_ms),
            payment_success_rate: self.success_rate,
            payment_seed: self.seed,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.json_logs);

    let broker = InMemoryBroker::connect(cli.spool_dir)
        .await
        .inspect_err(|e| error!(error = %e, "Failed to connect to broker"))
        .into_diagnostic()?;
    declare_topology(&broker)
        .await
        .inspect_err(|e| error!(error = %e, "Failed to declare queues"))
        .into_diagnostic()?;

    match cli.command {
        Command::Producer(args) => {
            publish_orders(&broker, &args).await?;
            broker.close().await.into_diagnostic()?;
            info!("Producer finished");
        }
        Command::Consumer(args) => {
            let running = router(&broker, &args.config())?
                .start()
                .await
                .into_diagnostic()?;
            info!("Consumers running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.into_diagnostic()?;
            running.shutdown().await.into_diagnostic()?;
        }
        Command::Demo { producer, consumer } => {
            publish_orders(&broker, &producer).await?;
            let running = router(&broker, &consumer.config())?
                .start()
                .await
                .into_diagnostic()?;
            tokio::select! {
                result = wait_until_processed(&broker) => result.into_diagnostic()?,
                _ = tokio::signal::ctrl_c() => warn!("Interrupted before all orders were processed"),
            }
            running.shutdown().await.into_diagnostic()?;
            print_sinks(&broker).await?;
        }
    }

    Ok(())
}

fn router(broker: &InMemoryBroker, config: &PipelineConfig) -> Result<PipelineRouter> {
    let payments = SimulatedPaymentGateway::new(
        config.payment_success_rate,
        config.payment_latency,
        config.payment_seed,
    )
    .into_diagnostic()?;
    let gateway: GatewayRef = Arc::new(broker.clone());
    Ok(PipelineRouter::fulfillment(gateway, Arc::new(payments), config))
}

fn load_orders(args: &ProducerArgs) -> Result<Vec<Order>> {
    let Some(path) = &args.orders else {
        return Ok(sample_orders());
    };
    let file = File::open(path).into_diagnostic()?;
    let mut orders = Vec::new();
    for order in OrderReader::new(file).orders() {
        match order {
            Ok(order) => orders.push(order),
            Err(e) => error!(error = %e, "Error reading order"),
        }
    }
    Ok(orders)
}

async fn publish_orders(broker: &InMemoryBroker, args: &ProducerArgs) -> Result<()> {
    let producer = OrderProducer::new(Arc::new(broker.clone()));
    let interval = Duration::from_millis(args.interval_ms);

    for (i, order) in load_orders(args)?.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(interval).await;
        }
        match producer.publish_order(order).await {
            Ok(()) => {}
            Err(e @ PipelineError::Validation(_)) => {
                warn!(order_id = %order.order_id, error = %e, "Order rejected");
            }
            Err(e) => return Err(e).into_diagnostic(),
        }
    }
    Ok(())
}

async fn wait_until_processed(broker: &InMemoryBroker) -> orderflow::error::Result<()> {
    loop {
        let pending = broker.outstanding(QueueName::Order).await?
            + broker.outstanding(QueueName::Payment).await?;
        if pending == 0 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn print_sinks(broker: &InMemoryBroker) -> Result<()> {
    for queue in [
        QueueName::Inventory,
        QueueName::Notification,
        QueueName::DeadLetter,
    ] {
        for body in broker.drain(queue).await.into_diagnostic()? {
            println!("{}: {}", queue, String::from_utf8_lossy(&body));
        }
    }
    Ok(())
}
