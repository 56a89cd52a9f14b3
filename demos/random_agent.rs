extern crate rand;
extern crate robot_gym;

use rand::thread_rng;
use robot_gym::*;

// NOTE: Needs a current booking. Set ROBOT_GYM_TOKEN (and ROBOT_GYM_ENDPOINT if
// the server is not local), or pass a JSON config file as the first argument.

fn main() -> Result<()> {
    logging::init();

    let config = match std::env::args().nth(1) {
        Some(path) => EnvConfig::from_json_file(path)?,
        None => {
            let mut config = EnvConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    let mut env = RealEnv::connect(config)?;
    println!("observation space:\n{:?}\n", env.observation_space().descriptor());
    println!("action space:\n{:?}\n", env.action_space().descriptor());

    let mut rng = thread_rng();
    for ep in 0..3 {
        env.reset()?;
        let mut tot_reward = 0.;
        loop {
            let action = env.action_space().sample(&mut rng);
            let state = env.step(&action)?;
            tot_reward += state.reward;

            if state.truncated || state.terminated {
                println!(
                    "Finished episode {} after {} steps ({}) with total reward {}",
                    ep,
                    state.info["step"],
                    state.info["end_reason"],
                    tot_reward
                );
                break;
            }
        }
    }

    env.close()
}
