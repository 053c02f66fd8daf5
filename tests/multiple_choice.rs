use wsrpc::{call, name, DispatchError, Endpoint, Error, RpcFunction, Service};

pub struct MultipleChoice {
    answer: &'static str,
}

impl MultipleChoice {
    fn new() -> Self {
        let answer = ["a", "b", "c", "d"][rand::random::<usize>() % 4];
        println!("The correct answer will be {answer}");
        Self { answer }
    }
}

impl RpcFunction for MultipleChoice {
    name!("Guess");
    call! {
        async fn call(&self, guess: String) -> Result<String, String> {
            if !["a", "b", "c", "d"].contains(&guess.as_str()) {
                return Err(format!("{guess:?} is not one of the choices"));
            }
            Ok(if guess == self.answer { "right" } else { "wrong" }.to_owned())
        }
    }
}

#[tokio::test]
async fn exactly_one_guess_is_right() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (server, client) = tokio::join!(Endpoint::server(a), Endpoint::client(b));
    let (server, client) = (server.unwrap(), client.unwrap());
    server
        .register(Service::new("Quiz").add(MultipleChoice::new()))
        .unwrap();

    let info = server.methods().remove(0);
    assert_eq!(info.name, "Quiz.Guess");
    assert_eq!(info.signature.args, std::any::type_name::<String>());

    let mut rights = 0;
    let mut wrongs = 0;

    for ans in ["a", "b", "c", "d"] {
        let retval: String = client.call("Quiz.Guess", ans).await.unwrap();
        println!("{ans} is {retval}");

        if retval == "right" {
            rights += 1;
        } else {
            wrongs += 1;
        }
    }

    assert_eq!(rights, 1);
    assert_eq!(wrongs, 3);

    let err = client.call::<_, String>("Quiz.Guess", "x").await.unwrap_err();
    assert!(matches!(err, Error::Remote(DispatchError::Failed(_))));

    // Arguments that do not decode as a String never reach the function.
    let err = client.call::<_, String>("Quiz.Guess", &()).await.unwrap_err();
    assert!(matches!(err, Error::Remote(DispatchError::BadArgs(_))), "{err}");
    let err = client.call::<_, String>("Quiz.Guess", &10i64).await.unwrap_err();
    assert!(matches!(err, Error::Remote(DispatchError::BadArgs(_))), "{err}");

    client.close().await;
    server.close().await;
}
