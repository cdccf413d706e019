use evalbench_core::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), EvalError> {
    evalbench_core::init_observability();
    let evaluator = Evaluator::from_config(&EvalConfig::from_env()?)?.build()?;

    let groups = vec![
        ComparisonGroupSpec::new(ModelTarget::new("qwen-turbo")),
        ComparisonGroupSpec::new(ModelTarget::new("qwen-plus")),
    ];
    let mut stream = evaluator
        .compare(groups, &InputPayload::text("Name three uses of Rust."))
        .await?;

    let mut texts = [String::new(), String::new()];
    while let Some(item) = stream.next_event().await {
        match item {
            ComparisonEvent::Group(event) => {
                if let StreamEvent::Token { text } = event.event {
                    texts[event.group.index()].push_str(&text);
                }
            }
            ComparisonEvent::Finished(result) => {
                for group in Group::BOTH {
                    let outcome = result.outcome(group);
                    println!("== group {group} ({})", outcome.status.as_str());
                    println!("{}", texts[group.index()]);
                }
                println!("comparison {}", result.status.as_str());
            }
        }
    }
    Ok(())
}
