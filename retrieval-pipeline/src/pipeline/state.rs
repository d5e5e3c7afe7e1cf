use state_machines::state_machine;

state_machine! {
    name: RetrievalMachine,
    state: RetrievalState,
    initial: Init,
    states: [Init, CandidatesFetched, Scored, ThresholdChecked, TypeFiltered, Decided, Failed],
    events {
        fetch_candidates { transition: { from: Init, to: CandidatesFetched } }
        score { transition: { from: CandidatesFetched, to: Scored } }
        check_thresholds { transition: { from: Scored, to: ThresholdChecked } }
        filter_types { transition: { from: ThresholdChecked, to: TypeFiltered } }
        decide { transition: { from: TypeFiltered, to: Decided } }
        abort {
            transition: { from: Init, to: Failed }
            transition: { from: CandidatesFetched, to: Failed }
            transition: { from: Scored, to: Failed }
            transition: { from: ThresholdChecked, to: Failed }
            transition: { from: TypeFiltered, to: Failed }
        }
    }
}

pub fn init() -> RetrievalMachine<(), Init> {
    RetrievalMachine::new(())
}
