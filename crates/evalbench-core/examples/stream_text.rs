use evalbench_core::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), EvalError> {
    evalbench_core::init_observability();
    let evaluator = Evaluator::from_config(&EvalConfig::from_env()?)?.build()?;

    let mut call = evaluator
        .infer(
            &ModelTarget::new("qwen-turbo"),
            &InputPayload::text("Stream a greeting."),
            &GenerationParams::default().max_tokens(128),
            None,
        )
        .await?;

    while let Some(event) = call.next_event().await {
        match event {
            StreamEvent::Token { text } => print!("{text}"),
            StreamEvent::Done { elapsed_ms, .. } => println!("\n({elapsed_ms} ms)"),
            StreamEvent::Error { message, .. } => eprintln!("call error: {message}"),
            StreamEvent::Usage { .. } | StreamEvent::Audio { .. } => {}
        }
    }

    let outcome = call.finish().await?;
    println!("{} in / {} out", outcome.input_tokens, outcome.output_tokens);
    Ok(())
}
