// demos/basic_workflow.rs
//
// Signs in against a live identity service with a throwaway key:
//
//   SIWE_AUTH_BASE_URL=http://localhost:9999 \
//   SIWE_AUTH_ORIGIN_URL=http://localhost:3000 \
//   cargo run --example basic_workflow

use siwe_auth::{AuthConfig, AuthFlow, LocalKeySigner, SelfCheck};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Sign-In with Ethereum Example");

    // 1. Load configuration and build the flow
    let config = AuthConfig::from_env()?;
    let mut flow = AuthFlow::from_config(&config)?;

    // 2. A local key stands in for the browser wallet
    let signer = LocalKeySigner::random();
    println!("Wallet address: {}", signer.address().to_checksum());

    // 3. Request a challenge
    let challenge = flow
        .request_nonce(signer.address(), 1, &config.origin_url)
        .await?;
    println!("Challenge {}: {}", challenge.id, challenge.nonce);

    // 4. Sign it and check the signer locally
    let signed = flow.sign_challenge(&challenge, &signer).await?;
    match &signed.self_check {
        SelfCheck::Match => println!("Self-check: signer matches wallet"),
        SelfCheck::Mismatch { recovered, .. } => println!("Self-check: signed by {recovered}"),
        SelfCheck::Skipped => println!("Self-check: skipped"),
    }

    // 5. Exchange the signature for a session
    match flow.exchange(&signed.challenge_id, &signed.signature).await {
        Ok(credential) => {
            println!("Authentication successful!");
            println!("   User: {}", credential.user.id);
            println!("   Token type: {}", credential.token_type);
            println!("   Expires in: {}s", credential.expires_in);
        }
        Err(e) => {
            println!("Authentication failed: {}", e.kind().user_message());
            println!("   Detail: {e}");
        }
    }

    println!("Status: {:?}", flow.status());
    Ok(())
}
