extern crate rand;
extern crate robot_gym;

use rand::rngs::StdRng;
use rand::SeedableRng;
use robot_gym::*;

fn main() -> Result<()> {
    logging::init();

    let config = EnvConfig {
        variant: EnvVariant::MonolithObstacle,
        channels: Channels::Rgbd,
        seed: Some(2718),
        ..EnvConfig::simulated()
    };
    let mut env = make(config)?;
    let mut rng = StdRng::seed_from_u64(2718);

    for ep in 0..10 {
        let obs = env.reset()?;
        println!("episode {ep}: observation shape {:?}", obs.shape());
        let mut tot_reward = 0.;
        loop {
            let action = env.action_space().sample(&mut rng);
            let state = env.step(&action)?;
            tot_reward += state.reward;

            if state.truncated || state.terminated {
                if let RenderFrame::Rgb { rows, cols, .. } = env.render(RenderMode::RgbArray)? {
                    println!("last frame {rows}x{cols}");
                }
                println!(
                    "Finished episode {} ({}) with total reward {:.3}",
                    ep, state.info["end_reason"], tot_reward
                );
                break;
            }
        }
    }

    env.close()
}
